pub mod config;
pub mod model;
pub mod monitor;
pub mod notifier;
pub mod prober;
pub mod registry;
pub mod report;
pub mod store;

pub use config::MonitorConfig;
pub use model::{ConfigError, Device, DeviceId, DeviceStatus, Health, PingRecord};
pub use monitor::{Clock, DeviceMonitor, MonitorContext, MonitorHandle, Seed};
pub use notifier::{AlertEvent, AlertKind, FanoutNotifier, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use prober::{ProbeOutcome, Prober, TcpProber};
pub use registry::{MonitorRegistry, StartSummary};
pub use report::{build_reports, DeviceReport, Outage, Period};
pub use store::{DeviceStore, MemoryStore, StoreError};
