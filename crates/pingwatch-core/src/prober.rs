use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Result of one reachability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub latency: Option<Duration>,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn up(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            reachable: true,
            latency: Some(latency),
            detail: detail.into(),
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency: None,
            detail: detail.into(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::down(format!("timeout after {}ms", after.as_millis()))
    }
}

/// Performs a single reachability check against an address.
///
/// Implementations must return within `timeout`; a timeout is a normal
/// "down" observation, not an error.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome;
}

/// Probes by opening a TCP connection to the target.
///
/// Addresses without an explicit port use `default_port`.
#[derive(Debug, Clone)]
pub struct TcpProber {
    default_port: u16,
}

impl TcpProber {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    fn split_target(&self, address: &str) -> (String, u16) {
        let address = address.trim();
        if let Ok(sock) = address.parse::<SocketAddr>() {
            return (sock.ip().to_string(), sock.port());
        }
        // a bare IPv6 literal has several colons and no port
        if address.matches(':').count() == 1 {
            if let Some((host, port)) = address.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return (host.to_string(), port);
                }
            }
        }
        let host = address.trim_start_matches('[').trim_end_matches(']');
        (host.to_string(), self.default_port)
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(80)
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str, limit: Duration) -> ProbeOutcome {
        let (host, port) = self.split_target(address);
        let started = Instant::now();

        match timeout(limit, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_stream)) => {
                let rtt = started.elapsed();
                debug!(%host, port, rtt_ms = %rtt.as_millis(), "tcp connect ok");
                ProbeOutcome::up(rtt, format!("connected to {host}:{port}"))
            }
            Ok(Err(err)) => ProbeOutcome::down(describe_io_error(&err)),
            Err(_) => ProbeOutcome::timed_out(limit),
        }
    }
}

fn describe_io_error(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
        io::ErrorKind::TimedOut => "connection timed out".to_string(),
        _ => format!("io error: {err}"),
    }
}
