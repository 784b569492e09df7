use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::model::{Device, PingRecord};
use crate::store::{DeviceStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outage {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: u64,
    /// Still down at the end of the window, or now if that comes first.
    pub ongoing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: Device,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_probes: usize,
    pub failed_probes: usize,
    pub availability_pct: f64,
    pub avg_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub outages: Vec<Outage>,
}

impl DeviceReport {
    /// An outage still open at the end is closed at `min(to, now)`, so a
    /// window reaching into the future never reports future downtime.
    pub fn from_records(
        device: Device,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
        records: &[PingRecord],
    ) -> Self {
        let mut sorted: Vec<&PingRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.timestamp);

        let total_probes = sorted.len();
        let failed_probes = sorted.iter().filter(|r| !r.reachable).count();
        let availability_pct = if total_probes > 0 {
            (total_probes - failed_probes) as f64 / total_probes as f64 * 100.0
        } else {
            0.0
        };

        let latencies: Vec<f64> = sorted
            .iter()
            .filter(|r| r.reachable)
            .filter_map(|r| r.latency_ms())
            .collect();
        let avg_latency_ms = (!latencies.is_empty()).then(|| latencies.iter().sum::<f64>() / latencies.len() as f64);
        let max_latency_ms = latencies.iter().copied().reduce(f64::max);

        Self {
            device,
            from,
            to,
            total_probes,
            failed_probes,
            availability_pct,
            avg_latency_ms,
            max_latency_ms,
            outages: find_outages(&sorted, to.min(now)),
        }
    }
}

fn find_outages(sorted: &[&PingRecord], window_end: DateTime<Utc>) -> Vec<Outage> {
    let mut outages = Vec::new();
    let mut started: Option<DateTime<Utc>> = None;

    for record in sorted {
        match (record.reachable, started) {
            (false, None) => started = Some(record.timestamp),
            (true, Some(start)) => {
                outages.push(outage(start, record.timestamp, false));
                started = None;
            }
            _ => {}
        }
    }

    if let Some(start) = started {
        outages.push(outage(start, window_end.max(start), true));
    }
    outages
}

fn outage(start: DateTime<Utc>, end: DateTime<Utc>, ongoing: bool) -> Outage {
    let duration = (end - start).to_std().unwrap_or(Duration::ZERO);
    Outage {
        start,
        end,
        duration_secs: duration.as_secs(),
        ongoing,
    }
}

/// Report window expressed in local calendar terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    ThisMonth,
    ThisYear,
}

impl Period {
    /// `[start, end]` of the period containing `now`.
    pub fn bounds(&self, now: DateTime<Local>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.date_naive();
        let (first, next) = match self {
            Period::Today => (today, today.succ_opt()),
            Period::ThisMonth => {
                let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
                let next = if today.month() == 12 {
                    NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
                };
                (first, next)
            }
            Period::ThisYear => (
                NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
                NaiveDate::from_ymd_opt(today.year() + 1, 1, 1),
            ),
        };

        let start = local_midnight(first).unwrap_or_else(|| now.with_timezone(&Utc));
        let end = next
            .and_then(local_midnight)
            .map(|t| t - chrono::Duration::milliseconds(1))
            .unwrap_or_else(|| now.with_timezone(&Utc));
        (start, end)
    }
}

fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Builds a report for every device in the store over `[from, to]`.
pub async fn build_reports(
    store: &dyn DeviceStore,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<DeviceReport>, StoreError> {
    let mut reports = Vec::new();
    for device in store.list_devices().await? {
        let records = store.ping_records(device.id, from, to).await?;
        reports.push(DeviceReport::from_records(device, from, to, now, &records));
    }
    Ok(reports)
}
