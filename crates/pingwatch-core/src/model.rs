use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MIN_INTERVAL_SECS;

pub type DeviceId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub address: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub interval_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device {id}: interval of {interval_seconds}s is below the {min}s minimum")]
    IntervalTooShort {
        id: DeviceId,
        interval_seconds: u64,
        min: u64,
    },
    #[error("device {0}: address is empty")]
    MissingAddress(DeviceId),
    #[error("device {0} is disabled")]
    Disabled(DeviceId),
}

impl Device {
    pub fn new(id: DeviceId, address: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            address: address.into(),
            display_name: display_name.into(),
            description: None,
            enabled: true,
            interval_seconds: MIN_INTERVAL_SECS,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Checks that the device may be monitored at all.
    pub fn validate(&self, min_interval: Duration) -> Result<(), ConfigError> {
        if !self.enabled {
            return Err(ConfigError::Disabled(self.id));
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingAddress(self.id));
        }
        if self.interval() < min_interval {
            return Err(ConfigError::IntervalTooShort {
                id: self.id,
                interval_seconds: self.interval_seconds,
                min: min_interval.as_secs(),
            });
        }
        Ok(())
    }

    /// True when a running monitor must be replaced to pick up the change.
    pub fn monitoring_differs(&self, other: &Device) -> bool {
        self.address != other.address
            || self.interval_seconds != other.interval_seconds
            || self.enabled != other.enabled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    /// Assigned by the store; zero until appended.
    #[serde(default)]
    pub id: u64,
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "latency_ms", with = "latency_ms")]
    pub latency: Option<Duration>,
    pub reachable: bool,
    pub detail: String,
}

impl PingRecord {
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.map(|l| l.as_nanos() as f64 / 1_000_000.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Up,
    Down,
    Unknown,
}

impl Health {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Health::Up
        } else {
            Health::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Up => "up",
            Health::Down => "down",
            Health::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: Device,
    pub last_record: Option<PingRecord>,
    pub monitored: bool,
}

impl DeviceStatus {
    pub fn health(&self) -> Health {
        self.last_record
            .as_ref()
            .map(|r| Health::from_reachable(r.reachable))
            .unwrap_or(Health::Unknown)
    }
}

mod latency_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(latency) => serializer.serialize_some(&(latency.as_nanos() as f64 / 1_000_000.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<f64>::deserialize(deserializer)?;
        Ok(ms
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| Duration::from_nanos((v * 1_000_000.0).round() as u64)))
    }
}
