use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use pingwatch_core::{
    build_reports, Device, DeviceId, DeviceReport, DeviceStatus, DeviceStore, FanoutNotifier, LogNotifier,
    MonitorConfig, MonitorContext, MonitorRegistry, Notifier, Period, Prober, TcpProber, WebhookNotifier,
};
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(test)]
mod cli_tests;
mod file_store;
#[cfg(test)]
mod file_store_tests;
mod viewer;

use file_store::FileStore;

#[derive(Debug, Parser)]
#[command(name = "pingwatchd")]
#[command(about = "Network device availability monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "./devices.json")]
    devices: String,

    #[arg(long, default_value = "./data/history")]
    history_dir: String,

    #[arg(long, default_value_t = 90)]
    retention_days: u64,

    #[arg(long, default_value_t = 10_000)]
    probe_timeout_ms: u64,

    #[arg(long, default_value_t = 80)]
    default_port: u16,

    /// Start monitors from the last stored state instead of unknown.
    #[arg(long)]
    seed_from_store: bool,

    #[arg(long)]
    webhook_url: Option<String>,

    /// Telegram bot token; alerts go to `--telegram-chat-id` when both are set.
    #[arg(long, requires = "telegram_chat_id")]
    telegram_bot_token: Option<String>,

    #[arg(long, requires = "telegram_bot_token")]
    telegram_chat_id: Option<String>,
}

/// Where alerts are delivered besides the log.
#[derive(Debug, Default, Clone)]
struct AlertTargets {
    webhook_url: Option<String>,
    telegram: Option<(String, String)>,
}

impl AlertTargets {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            webhook_url: cli.webhook_url.clone(),
            telegram: cli.telegram_bot_token.clone().zip(cli.telegram_chat_id.clone()),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    Run {
        #[arg(long, default_value_t = 30)]
        reload_secs: u64,
        #[arg(long, default_value_t = 60)]
        status_secs: u64,
    },
    Once {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Status {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Report {
        #[arg(long, value_enum, default_value = "today")]
        period: ReportPeriod,
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    View {
        #[arg(long, default_value_t = 1000)]
        refresh_ms: u64,
        #[arg(long, default_value_t = 600.0)]
        window_sec: f64,
    },
    Devices {
        #[command(subcommand)]
        command: DevicesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DevicesCommand {
    List,
    Add {
        address: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = 30)]
        interval: u64,
        #[arg(long)]
        disabled: bool,
    },
    Remove {
        id: DeviceId,
    },
    Enable {
        id: DeviceId,
    },
    Disable {
        id: DeviceId,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportPeriod {
    Today,
    Month,
    Year,
}

impl From<ReportPeriod> for Period {
    fn from(value: ReportPeriod) -> Self {
        match value {
            ReportPeriod::Today => Period::Today,
            ReportPeriod::Month => Period::ThisMonth,
            ReportPeriod::Year => Period::ThisYear,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let alerts = AlertTargets::from_cli(&cli);

    let config = MonitorConfig {
        probe_timeout_ceiling: Duration::from_millis(cli.probe_timeout_ms),
        seed_from_store: cli.seed_from_store,
        ..MonitorConfig::default()
    };

    let store = Arc::new(
        FileStore::open(&cli.devices, &cli.history_dir, cli.retention_days)
            .with_context(|| format!("opening store at {}", cli.devices))?,
    );
    let prober: Arc<dyn Prober> = Arc::new(TcpProber::new(cli.default_port));

    match cli.command {
        Command::Run {
            reload_secs,
            status_secs,
        } => {
            let registry = build_registry(prober, store.clone(), config, &alerts);
            run_loop(&registry, &store, reload_secs, status_secs).await?;
        }
        Command::Once { format } => {
            probe_once(prober.as_ref(), store.as_ref(), &config, format).await?;
        }
        Command::Status { format } => {
            let registry = build_registry(prober, store, config, &AlertTargets::default());
            let view = registry.current_status().await?;
            print_status(view.values(), format)?;
        }
        Command::Report { period, format } => {
            let now = Local::now();
            let (from, to) = Period::from(period).bounds(now);
            let reports = build_reports(store.as_ref(), from, to, now.with_timezone(&Utc)).await?;
            print_reports(&reports, format)?;
        }
        Command::View {
            refresh_ms,
            window_sec,
        } => {
            let registry = build_registry(prober, store, config, &alerts);
            registry.start_all().await?;
            let result = viewer::run_viewer(&registry, Duration::from_millis(refresh_ms), window_sec).await;
            registry.stop_all().await;
            result?;
        }
        Command::Devices { command } => edit_devices(store.as_ref(), command).await?,
    }

    Ok(())
}

fn build_registry(
    prober: Arc<dyn Prober>,
    store: Arc<FileStore>,
    config: MonitorConfig,
    alerts: &AlertTargets,
) -> MonitorRegistry {
    let mut targets: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(url) = &alerts.webhook_url {
        let (webhook, _delivery) = WebhookNotifier::spawn(url.as_str(), 64);
        targets.push(Box::new(webhook));
    }
    if let Some((bot_token, chat_id)) = &alerts.telegram {
        let (telegram, _delivery) = WebhookNotifier::spawn_telegram(bot_token, chat_id.as_str(), 64);
        targets.push(Box::new(telegram));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(targets));
    MonitorRegistry::new(MonitorContext::new(prober, store, notifier, config))
}

async fn run_loop(registry: &MonitorRegistry, store: &FileStore, reload_secs: u64, status_secs: u64) -> Result<()> {
    registry.start_all().await?;

    let reload_every = Duration::from_secs(reload_secs.max(1));
    let status_every = Duration::from_secs(status_secs.max(1));
    let mut reload = interval_at(Instant::now() + reload_every, reload_every);
    let mut status = interval_at(Instant::now() + status_every, status_every);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = reload.tick() => {
                match store.reload_devices().await {
                    Ok(devices) => {
                        let summary = registry.reconcile(&devices).await;
                        if !summary.started.is_empty() || !summary.stopped.is_empty() {
                            info!(started = ?summary.started, stopped = ?summary.stopped, rejected = summary.rejected.len(), "devices reloaded");
                        }
                    }
                    Err(err) => warn!(error = %err, "device reload failed, keeping current monitors"),
                }
            }
            _ = status.tick() => {
                match registry.current_status().await {
                    Ok(view) => {
                        for entry in view.values() {
                            info!(
                                device_id = entry.device.id,
                                name = %entry.device.display_name,
                                health = entry.health().as_str(),
                                latency_ms = ?entry.last_record.as_ref().and_then(|r| r.latency_ms()),
                                monitored = entry.monitored,
                                "status"
                            );
                        }
                    }
                    Err(err) => warn!(error = %err, "status unavailable"),
                }
            }
        }
    }

    registry.stop_all().await;
    Ok(())
}

async fn probe_once(prober: &dyn Prober, store: &dyn DeviceStore, config: &MonitorConfig, format: OutputFormat) -> Result<()> {
    let mut results = Vec::new();
    for device in store.list_devices().await?.into_iter().filter(|d| d.enabled) {
        let outcome = prober
            .probe(&device.address, config.probe_timeout_for(device.interval()))
            .await;
        results.push((device, outcome));
    }

    match format {
        OutputFormat::Json => {
            let out: Vec<_> = results
                .iter()
                .map(|(device, outcome)| {
                    serde_json::json!({
                        "device_id": device.id,
                        "address": device.address,
                        "reachable": outcome.reachable,
                        "latency_ms": outcome.latency.map(|l| l.as_secs_f64() * 1000.0),
                        "detail": outcome.detail,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Human => {
            for (device, outcome) in &results {
                println!(
                    "{:>4}  {:<24} {:<20} {:<5} {:>9}  {}",
                    device.id,
                    device.display_name,
                    device.address,
                    if outcome.reachable { "up" } else { "down" },
                    outcome
                        .latency
                        .map(|l| format!("{:.1}ms", l.as_secs_f64() * 1000.0))
                        .unwrap_or_else(|| "-".to_string()),
                    outcome.detail
                );
            }
        }
    }
    Ok(())
}

fn print_status<'a>(view: impl Iterator<Item = &'a DeviceStatus>, format: OutputFormat) -> Result<()> {
    let entries: Vec<&DeviceStatus> = view.collect();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Human => {
            for entry in entries {
                let last = entry
                    .last_record
                    .as_ref()
                    .map(|r| r.timestamp.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S").to_string())
                    .unwrap_or_else(|| "no data".to_string());
                let latency = entry
                    .last_record
                    .as_ref()
                    .and_then(|r| r.latency_ms())
                    .map(|ms| format!("{ms:.1}ms"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>4}  {:<24} {:<20} {:<8} {:>9}  {}{}",
                    entry.device.id,
                    entry.device.display_name,
                    entry.device.address,
                    entry.health().as_str(),
                    latency,
                    last,
                    if entry.device.enabled { "" } else { "  (disabled)" }
                );
            }
        }
    }
    Ok(())
}

fn print_reports(reports: &[DeviceReport], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(reports)?),
        OutputFormat::Human => {
            for report in reports {
                println!("=== {} ({}) ===", report.device.display_name, report.device.address);
                println!(
                    "Probes:       {} total, {} failed, {:.2}% available",
                    report.total_probes, report.failed_probes, report.availability_pct
                );
                println!(
                    "Latency:      avg {}  max {}",
                    fmt_ms(report.avg_latency_ms),
                    fmt_ms(report.max_latency_ms)
                );
                if report.outages.is_empty() {
                    println!("Outages:      none");
                }
                for outage in &report.outages {
                    println!(
                        "Outage:       {} -> {}  ({} min{})",
                        outage.start.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S"),
                        outage.end.with_timezone(&Local).format("%d/%m/%Y %H:%M:%S"),
                        outage.duration_secs / 60,
                        if outage.ongoing { ", ongoing" } else { "" }
                    );
                }
            }
        }
    }
    Ok(())
}

fn fmt_ms(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}ms")).unwrap_or_else(|| "n/a".to_string())
}

async fn edit_devices(store: &FileStore, command: DevicesCommand) -> Result<()> {
    match command {
        DevicesCommand::List => {
            let devices = store.list_devices().await?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        DevicesCommand::Add {
            address,
            name,
            description,
            interval,
            disabled,
        } => {
            let mut device = Device::new(store.next_device_id()?, address, name);
            device.description = description;
            device.interval_seconds = interval;
            device.enabled = !disabled;
            if device.enabled {
                device.validate(MonitorConfig::default().min_interval)?;
            }
            let id = device.id;
            store.upsert_device(device).await?;
            println!("added device {id}");
        }
        DevicesCommand::Remove { id } => {
            store.delete_device(id).await?;
            println!("removed device {id} and its history");
        }
        DevicesCommand::Enable { id } => set_enabled(store, id, true).await?,
        DevicesCommand::Disable { id } => set_enabled(store, id, false).await?,
    }
    Ok(())
}

async fn set_enabled(store: &FileStore, id: DeviceId, enabled: bool) -> Result<()> {
    let Some(mut device) = store.get_device(id).await? else {
        bail!("device {id} not found");
    };
    device.enabled = enabled;
    device.updated_at = Utc::now();
    if enabled {
        device.validate(MonitorConfig::default().min_interval)?;
    }
    store.upsert_device(device).await?;
    println!("device {id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}
