use std::time::Duration;

/// Shortest interval a device may be polled at.
pub const MIN_INTERVAL_SECS: u64 = 5;

/// Headroom kept between the probe timeout and the polling interval.
pub const PROBE_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub min_interval: Duration,
    pub probe_timeout_ceiling: Duration,
    pub seed_from_store: bool,
}

impl MonitorConfig {
    /// Timeout applied to a single probe of a device polled every `interval`.
    ///
    /// Always strictly shorter than `interval` so a hung probe cannot eat
    /// into the next tick.
    pub fn probe_timeout_for(&self, interval: Duration) -> Duration {
        let bound = interval.saturating_sub(PROBE_TIMEOUT_MARGIN);
        let timeout = self.probe_timeout_ceiling.min(bound);
        if timeout.is_zero() {
            interval / 2
        } else {
            timeout
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(MIN_INTERVAL_SECS),
            probe_timeout_ceiling: Duration::from_secs(10),
            seed_from_store: false,
        }
    }
}
