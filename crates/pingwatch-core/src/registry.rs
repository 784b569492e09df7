use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::model::{ConfigError, Device, DeviceId, DeviceStatus};
use crate::monitor::{DeviceMonitor, MonitorContext, MonitorHandle, Seed};
use crate::store::StoreError;

/// Outcome of starting or reconciling a batch of devices.
#[derive(Debug, Default)]
pub struct StartSummary {
    pub started: Vec<DeviceId>,
    pub stopped: Vec<DeviceId>,
    pub unchanged: Vec<DeviceId>,
    pub rejected: Vec<(DeviceId, ConfigError)>,
}

/// Owns every running device monitor.
///
/// Lifecycle calls are serialised through one lock so a replaced monitor
/// has fully exited before its successor is spawned.
pub struct MonitorRegistry {
    ctx: MonitorContext,
    monitors: Mutex<HashMap<DeviceId, MonitorHandle>>,
    generation: AtomicU64,
}

impl MonitorRegistry {
    pub fn new(ctx: MonitorContext) -> Self {
        Self {
            ctx,
            monitors: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn default_seed(&self) -> Seed {
        if self.ctx.config.seed_from_store {
            Seed::FromStore
        } else {
            Seed::Unknown
        }
    }

    /// Starts (or replaces) the monitor for `device`.
    pub async fn start(&self, device: Device) -> Result<u64, ConfigError> {
        self.launch(device, false).await
    }

    /// With `reset_running`, a monitor that is being replaced hands its
    /// successor unknown state instead of the configured seed. The choice is
    /// made under the map lock so a concurrent stop cannot change it.
    async fn launch(&self, device: Device, reset_running: bool) -> Result<u64, ConfigError> {
        device.validate(self.ctx.config.min_interval)?;

        let mut monitors = self.monitors.lock().await;
        let previous = monitors.remove(&device.id);
        let seed = if reset_running && previous.is_some() {
            Seed::Unknown
        } else {
            self.default_seed()
        };
        if let Some(previous) = previous {
            debug!(device_id = device.id, generation = previous.generation(), "replacing running monitor");
            previous.stop().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let id = device.id;
        let handle = DeviceMonitor::spawn(device, self.ctx.clone(), seed, generation)?;
        monitors.insert(id, handle);
        Ok(generation)
    }

    /// Stops the monitor for `device_id`; returns whether one was running.
    pub async fn stop(&self, device_id: DeviceId) -> bool {
        let mut monitors = self.monitors.lock().await;
        match monitors.remove(&device_id) {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Starts a monitor for every enabled device in the store.
    ///
    /// A device that fails validation is reported and skipped; the rest
    /// still start.
    pub async fn start_all(&self) -> Result<StartSummary, StoreError> {
        let devices = self.ctx.store.list_devices().await?;
        let mut summary = StartSummary::default();

        for device in devices.into_iter().filter(|d| d.enabled) {
            let id = device.id;
            match self.start(device).await {
                Ok(_) => summary.started.push(id),
                Err(err) => {
                    warn!(device_id = id, error = %err, "device not started");
                    summary.rejected.push((id, err));
                }
            }
        }

        info!(started = summary.started.len(), rejected = summary.rejected.len(), "monitors started");
        Ok(summary)
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.lock().await;
        let count = monitors.len();
        for (_, handle) in monitors.drain() {
            handle.stop().await;
        }
        info!(stopped = count, "all monitors stopped");
    }

    /// Called when a device is created, edited or enabled.
    ///
    /// A running monitor is replaced with fresh unknown state so the edit
    /// itself never produces a transition alert. A disabled device is
    /// stopped. An invalid edit is rejected and leaves any running
    /// monitor untouched.
    pub async fn on_device_enabled(&self, device: Device) -> Result<(), ConfigError> {
        if !device.enabled {
            self.on_device_disabled(device.id).await;
            return Ok(());
        }

        self.launch(device, true).await.map(|_| ())
    }

    /// Called when a device is disabled or deleted. Deleting history is the
    /// store's job.
    pub async fn on_device_disabled(&self, device_id: DeviceId) {
        if self.stop(device_id).await {
            info!(device_id, "monitor stopped");
        }
    }

    /// Brings the running set in line with a complete device list.
    pub async fn reconcile(&self, devices: &[Device]) -> StartSummary {
        let mut summary = StartSummary::default();
        let desired: HashSet<DeviceId> = devices.iter().filter(|d| d.enabled).map(|d| d.id).collect();

        let running: HashMap<DeviceId, Device> = {
            let monitors = self.monitors.lock().await;
            monitors
                .iter()
                .map(|(id, handle)| (*id, handle.device().clone()))
                .collect()
        };

        for id in running.keys().filter(|id| !desired.contains(id)) {
            self.on_device_disabled(*id).await;
            summary.stopped.push(*id);
        }

        for device in devices.iter().filter(|d| d.enabled) {
            if let Some(current) = running.get(&device.id) {
                if !current.monitoring_differs(device) {
                    summary.unchanged.push(device.id);
                    continue;
                }
            }
            match self.on_device_enabled(device.clone()).await {
                Ok(()) => summary.started.push(device.id),
                Err(err) => {
                    warn!(device_id = device.id, error = %err, "device not started");
                    summary.rejected.push((device.id, err));
                }
            }
        }

        summary
    }

    pub async fn is_running(&self, device_id: DeviceId) -> bool {
        self.monitors.lock().await.contains_key(&device_id)
    }

    pub async fn running_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.monitors.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Latest record of every known device.
    ///
    /// Devices without history, or whose history cannot be read right now,
    /// are reported with no record instead of failing the whole view.
    pub async fn current_status(&self) -> Result<BTreeMap<DeviceId, DeviceStatus>, StoreError> {
        let devices = self.ctx.store.list_devices().await?;
        let running: HashSet<DeviceId> = self.running_ids().await.into_iter().collect();
        let mut view = BTreeMap::new();

        for device in devices {
            let last_record = match self.ctx.store.most_recent_ping_record(device.id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(device_id = device.id, error = %err, "latest record unavailable");
                    None
                }
            };
            view.insert(
                device.id,
                DeviceStatus {
                    monitored: running.contains(&device.id),
                    device,
                    last_record,
                },
            );
        }

        Ok(view)
    }
}
