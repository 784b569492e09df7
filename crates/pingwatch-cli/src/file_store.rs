use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use pingwatch_core::{Device, DeviceId, DeviceStore, MemoryStore, PingRecord, StoreError};
use tracing::{debug, warn};

const HISTORY_PREFIX: &str = "ping-";
const HISTORY_SUFFIX: &str = ".jsonl";
const PRUNE_EVERY: Duration = Duration::from_secs(1800);

/// Device list in a JSON file, history in daily JSONL files.
///
/// Everything is mirrored in memory so queries never touch the disk. Device
/// ids are never reused: the next free id is kept in a file beside the
/// device list, so history a stale writer appends for a deleted device can
/// never attach to a newer one.
pub struct FileStore {
    devices_path: PathBuf,
    next_id_path: PathBuf,
    history_dir: PathBuf,
    retention_days: u64,
    inner: MemoryStore,
    next_id: Mutex<DeviceId>,
    journal: Mutex<Journal>,
}

struct Journal {
    current_day: String,
    writer: Option<BufWriter<File>>,
    last_prune: Option<Instant>,
}

impl FileStore {
    pub fn open(
        devices_path: impl Into<PathBuf>,
        history_dir: impl Into<PathBuf>,
        retention_days: u64,
    ) -> Result<Self, StoreError> {
        let devices_path = devices_path.into();
        let next_id_path = devices_path.with_extension("next-id");
        let history_dir = history_dir.into();
        fs::create_dir_all(&history_dir)?;

        let devices = read_devices(&devices_path)?;
        let history = read_history(&history_dir)?;
        let next_id = read_next_id(&next_id_path)?
            .unwrap_or(1)
            .max(devices.iter().map(|d| d.id + 1).max().unwrap_or(1))
            .max(history.iter().map(|r| r.device_id + 1).max().unwrap_or(1));

        let inner = MemoryStore::with_devices(devices);
        inner.restore_records(history)?;

        Ok(Self {
            devices_path,
            next_id_path,
            history_dir,
            retention_days,
            inner,
            next_id: Mutex::new(next_id),
            journal: Mutex::new(Journal {
                current_day: String::new(),
                writer: None,
                last_prune: None,
            }),
        })
    }

    /// Re-reads the device file, dropping devices that disappeared from it
    /// along with any history written for them since they were removed.
    pub async fn reload_devices(&self) -> Result<Vec<Device>, StoreError> {
        let on_disk = read_devices(&self.devices_path)?;
        for known in self.inner.list_devices().await? {
            if !on_disk.iter().any(|d| d.id == known.id) {
                self.inner.delete_device(known.id).await?;
                purge_device_history(&self.history_dir, known.id)?;
            }
        }
        for device in &on_disk {
            self.reserve_id(device.id)?;
            self.inner.upsert_device(device.clone()).await?;
        }
        if let Some(on_file) = read_next_id(&self.next_id_path)? {
            self.reserve_id(on_file.saturating_sub(1))?;
        }
        Ok(on_disk)
    }

    /// Id for the next device added; ids of deleted devices are not reused.
    pub fn next_device_id(&self) -> Result<DeviceId, StoreError> {
        Ok(*self.lock_next_id()?)
    }

    fn lock_next_id(&self) -> Result<MutexGuard<'_, DeviceId>, StoreError> {
        self.next_id
            .lock()
            .map_err(|_| StoreError::Unavailable("device id lock poisoned".to_string()))
    }

    fn reserve_id(&self, id: DeviceId) -> Result<(), StoreError> {
        let mut next_id = self.lock_next_id()?;
        *next_id = (*next_id).max(id + 1);
        Ok(())
    }

    async fn save_devices(&self) -> Result<(), StoreError> {
        let devices = self.inner.list_devices().await?;
        let tmp = self.devices_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&devices)?)?;
        fs::rename(&tmp, &self.devices_path)?;

        let next_id = self.next_device_id()?;
        let tmp = self.next_id_path.with_extension("next-id.tmp");
        fs::write(&tmp, format!("{next_id}\n"))?;
        fs::rename(&tmp, &self.next_id_path)?;
        Ok(())
    }

    fn journal(&self, record: &PingRecord) -> Result<(), StoreError> {
        let mut journal = self
            .journal
            .lock()
            .map_err(|_| StoreError::Unavailable("journal lock poisoned".to_string()))?;

        let day = record.timestamp.format("%Y-%m-%d").to_string();
        if journal.writer.is_none() || day != journal.current_day {
            if let Some(writer) = journal.writer.as_mut() {
                writer.flush()?;
            }
            journal.writer = Some(open_writer(&self.history_dir, &day)?);
            journal.current_day = day;
        }

        if let Some(writer) = journal.writer.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        if journal.last_prune.map_or(true, |at| at.elapsed() >= PRUNE_EVERY) {
            journal.last_prune = Some(Instant::now());
            prune_old_history_files(&self.history_dir, self.retention_days, SystemTime::now())?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for FileStore {
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.inner.list_devices().await
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        self.inner.get_device(id).await
    }

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        self.reserve_id(device.id)?;
        self.inner.upsert_device(device).await?;
        self.save_devices().await
    }

    async fn delete_device(&self, id: DeviceId) -> Result<(), StoreError> {
        self.inner.delete_device(id).await?;
        self.save_devices().await?;
        purge_device_history(&self.history_dir, id)
    }

    async fn append_ping_record(&self, record: PingRecord) -> Result<u64, StoreError> {
        let id = self.inner.append_ping_record(record.clone()).await?;
        self.journal(&PingRecord { id, ..record })?;
        Ok(id)
    }

    async fn most_recent_ping_record(&self, device_id: DeviceId) -> Result<Option<PingRecord>, StoreError> {
        self.inner.most_recent_ping_record(device_id).await
    }

    async fn most_recent_down_record(&self, device_id: DeviceId) -> Result<Option<PingRecord>, StoreError> {
        self.inner.most_recent_down_record(device_id).await
    }

    async fn ping_records(
        &self,
        device_id: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PingRecord>, StoreError> {
        self.inner.ping_records(device_id, from, to).await
    }
}

fn read_devices(path: &Path) -> Result<Vec<Device>, StoreError> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn read_next_id(path: &Path) -> Result<Option<DeviceId>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", path.display()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn open_writer(dir: &Path, day: &str) -> Result<BufWriter<File>, StoreError> {
    let path = dir.join(format!("{HISTORY_PREFIX}{day}{HISTORY_SUFFIX}"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn history_files(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, StoreError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        let Some(date_part) = file_name
            .strip_prefix(HISTORY_PREFIX)
            .and_then(|v| v.strip_suffix(HISTORY_SUFFIX))
        else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        files.push((date, path));
    }
    files.sort();
    Ok(files)
}

fn read_history(dir: &Path) -> Result<Vec<PingRecord>, StoreError> {
    let mut records = Vec::new();
    for (_, path) in history_files(dir)? {
        let reader = BufReader::new(File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PingRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(file = %path.display(), line = line_no + 1, error = %err, "skipping bad history line"),
            }
        }
    }
    debug!(records = records.len(), "history replayed");
    Ok(records)
}

/// Rewrites every history file without the lines of `device_id`.
pub(crate) fn purge_device_history(dir: &Path, device_id: DeviceId) -> Result<(), StoreError> {
    for (_, path) in history_files(dir)? {
        let content = fs::read_to_string(&path)?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                serde_json::from_str::<PingRecord>(line)
                    .map(|r| r.device_id != device_id)
                    .unwrap_or(true)
            })
            .collect();
        if kept.len() == content.lines().count() {
            continue;
        }
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        fs::write(&path, out)?;
    }
    Ok(())
}

pub(crate) fn prune_old_history_files(dir: &Path, retention_days: u64, now: SystemTime) -> Result<(), StoreError> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    for (date, path) in history_files(dir)? {
        if date < cutoff {
            if let Err(err) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %err, "could not remove expired history");
            }
        }
    }
    Ok(())
}
