use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::model::{ConfigError, Device, Health, PingRecord};
use crate::notifier::Notifier;
use crate::prober::{ProbeOutcome, Prober};
use crate::store::DeviceStore;

/// How long `stop` waits for a cancelled task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Wall-clock timestamps that never go backwards.
///
/// Anchored once and advanced with the tokio clock, so history written by a
/// single monitor is ordered even if the system clock is stepped.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_wall: DateTime<Utc>,
    base_mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base_wall: Utc::now(),
            base_mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = self.base_mono.elapsed();
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.base_wall.checked_add_signed(d))
            .unwrap_or(self.base_wall)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// The collaborators every monitor shares.
#[derive(Clone)]
pub struct MonitorContext {
    pub prober: Arc<dyn Prober>,
    pub store: Arc<dyn DeviceStore>,
    pub notifier: Arc<dyn Notifier>,
    pub config: MonitorConfig,
    pub clock: Clock,
}

impl MonitorContext {
    pub fn new(
        prober: Arc<dyn Prober>,
        store: Arc<dyn DeviceStore>,
        notifier: Arc<dyn Notifier>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            prober,
            store,
            notifier,
            config,
            clock: Clock::new(),
        }
    }
}

/// Where a freshly started monitor takes its initial state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    Unknown,
    FromStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    WentDown,
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MonitorState {
    last_known: Health,
}

impl MonitorState {
    fn unknown() -> Self {
        Self {
            last_known: Health::Unknown,
        }
    }

    fn observe(&mut self, reachable: bool) -> Option<Transition> {
        let next = Health::from_reachable(reachable);
        let transition = match (self.last_known, next) {
            (Health::Unknown, _) => None,
            (prev, next) if prev == next => None,
            (_, Health::Down) => Some(Transition::WentDown),
            _ => Some(Transition::Recovered),
        };
        self.last_known = next;
        transition
    }
}

/// A running monitor as seen from the outside.
pub struct MonitorHandle {
    device: Device,
    generation: u64,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the loop and waits for its task to exit.
    ///
    /// An in-flight probe is dropped rather than awaited.
    pub async fn stop(mut self) {
        let _ = self.cancel.send(true);
        if timeout(STOP_GRACE, &mut self.task).await.is_err() {
            warn!(device_id = self.device.id, generation = self.generation, "monitor ignored cancellation, aborting");
            self.task.abort();
        }
        debug!(device_id = self.device.id, generation = self.generation, "monitor stopped");
    }
}

/// Probe, record, detect and reschedule loop for one device.
pub struct DeviceMonitor {
    device: Device,
    ctx: MonitorContext,
    seed: Seed,
    generation: u64,
    probe_timeout: Duration,
    state: MonitorState,
}

impl DeviceMonitor {
    /// Validates the device and spawns its loop on the current runtime.
    pub fn spawn(
        device: Device,
        ctx: MonitorContext,
        seed: Seed,
        generation: u64,
    ) -> Result<MonitorHandle, ConfigError> {
        device.validate(ctx.config.min_interval)?;

        let probe_timeout = ctx.config.probe_timeout_for(device.interval());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let monitor = DeviceMonitor {
            device: device.clone(),
            ctx,
            seed,
            generation,
            probe_timeout,
            state: MonitorState::unknown(),
        };
        let task = tokio::spawn(monitor.run(cancel_rx));

        Ok(MonitorHandle {
            device,
            generation,
            cancel: cancel_tx,
            task,
        })
    }

    async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        info!(
            device_id = self.device.id,
            address = %self.device.address,
            interval_s = self.device.interval_seconds,
            probe_timeout_ms = %self.probe_timeout.as_millis(),
            generation = self.generation,
            "monitor started"
        );

        if self.seed == Seed::FromStore {
            self.seed_from_store().await;
        }

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                outcome = self.probe() => outcome,
            };

            if is_cancelled(&cancel) {
                debug!(device_id = self.device.id, "discarding probe result of stopped monitor");
                break;
            }

            self.handle_outcome(outcome, &cancel).await;

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = sleep(self.device.interval()) => {}
            }
        }

        debug!(device_id = self.device.id, generation = self.generation, "monitor loop exited");
    }

    async fn seed_from_store(&mut self) {
        match self.ctx.store.most_recent_ping_record(self.device.id).await {
            Ok(Some(record)) => {
                self.state.last_known = Health::from_reachable(record.reachable);
                debug!(device_id = self.device.id, seeded = self.state.last_known.as_str(), "state seeded from history");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(device_id = self.device.id, error = %err, "could not seed state, starting unknown");
            }
        }
    }

    async fn probe(&self) -> ProbeOutcome {
        let limit = self.probe_timeout;
        match timeout(limit, self.ctx.prober.probe(&self.device.address, limit)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::timed_out(limit),
        }
    }

    async fn handle_outcome(&mut self, outcome: ProbeOutcome, cancel: &watch::Receiver<bool>) {
        let timestamp = self.ctx.clock.now();
        let record = PingRecord {
            id: 0,
            device_id: self.device.id,
            timestamp,
            latency: if outcome.reachable { outcome.latency } else { None },
            reachable: outcome.reachable,
            detail: outcome.detail,
        };
        let latency_ms = record.latency_ms();

        match self.ctx.store.append_ping_record(record).await {
            Ok(id) => debug!(
                device_id = self.device.id,
                record_id = id,
                reachable = outcome.reachable,
                latency_ms = ?latency_ms,
                "probe recorded"
            ),
            Err(err) => error!(device_id = self.device.id, error = %err, "failed to persist ping record"),
        }

        if is_cancelled(cancel) {
            return;
        }

        match self.state.observe(outcome.reachable) {
            None => {}
            Some(Transition::WentDown) => {
                if let Err(err) = self.ctx.notifier.notify_down(&self.device, timestamp) {
                    warn!(device_id = self.device.id, error = %err, "down notification failed");
                }
            }
            Some(Transition::Recovered) => {
                let downtime = self.downtime(timestamp).await;
                if let Err(err) = self.ctx.notifier.notify_up(&self.device, timestamp, downtime) {
                    warn!(device_id = self.device.id, error = %err, "up notification failed");
                }
            }
        }
    }

    /// Time since the latest down record in the store. The record just
    /// written is an up record, so that is the last failed probe before it.
    /// Unknown rather than guessed when the store cannot say.
    async fn downtime(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.ctx.store.most_recent_down_record(self.device.id).await {
            Ok(record) => record.and_then(|r| (now - r.timestamp).to_std().ok()),
            Err(err) => {
                warn!(device_id = self.device.id, error = %err, "could not look up last down record");
                None
            }
        }
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Resolves once cancellation is requested or the handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
