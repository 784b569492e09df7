use crate::file_store::{prune_old_history_files, FileStore};
use chrono::{TimeZone, Utc};
use pingwatch_core::{Device, DeviceStore, PingRecord};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

fn make_temp_dir(name: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let uniq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch")
        .as_nanos();
    path.push(format!("pingwatch-tests-{name}-{uniq}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

/// A device created before any of the dated test records.
fn device(id: u64, address: &str, name: &str) -> Device {
    let mut device = Device::new(id, address, name);
    device.created_at = Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("valid date");
    device
}

fn record(device_id: u64, day: u32, reachable: bool) -> PingRecord {
    PingRecord {
        id: 0,
        device_id,
        timestamp: Utc
            .with_ymd_and_hms(2026, 2, day, 12, 0, 0)
            .single()
            .expect("valid date"),
        latency: reachable.then(|| Duration::from_millis(7)),
        reachable,
        detail: "refused".to_string(),
    }
}

#[test]
fn prune_removes_only_old_history_files() {
    // Arrange
    let dir = make_temp_dir("old-vs-fresh");
    let old_log = dir.join("ping-2025-11-16.jsonl");
    let fresh_log = dir.join("ping-2026-02-15.jsonl");
    let unrelated = dir.join("notes.txt");
    fs::write(&old_log, "old").expect("write old log");
    fs::write(&fresh_log, "fresh").expect("write fresh log");
    fs::write(&unrelated, "keep").expect("write unrelated");

    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 2, 15, 0, 0, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    prune_old_history_files(&dir, 90, now).expect("prune");

    // Assert
    assert!(!old_log.exists(), "old history should be pruned");
    assert!(fresh_log.exists(), "fresh history should be kept");
    assert!(unrelated.exists(), "non-history file should never be pruned");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn prune_keeps_boundary_age_history_file() {
    // Arrange
    let dir = make_temp_dir("boundary");
    let boundary_log = dir.join("ping-2025-11-17.jsonl");
    fs::write(&boundary_log, "boundary").expect("write boundary log");

    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 2, 15, 0, 0, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    prune_old_history_files(&dir, 90, now).expect("prune");

    // Assert
    assert!(
        boundary_log.exists(),
        "history exactly on retention boundary should be kept"
    );

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn history_survives_reopen() {
    // Arrange
    let dir = make_temp_dir("reopen");
    let devices = dir.join("devices.json");
    let history = dir.join("history");
    {
        let store = FileStore::open(&devices, &history, 3650).expect("open");
        store
            .upsert_device(device(1, "10.0.0.1", "gateway"))
            .await
            .expect("upsert");
        store.append_ping_record(record(1, 14, false)).await.expect("append");
        store.append_ping_record(record(1, 15, true)).await.expect("append");
    }

    // Act
    let reopened = FileStore::open(&devices, &history, 3650).expect("reopen");

    // Assert
    let latest = reopened
        .most_recent_ping_record(1)
        .await
        .expect("query")
        .expect("record");
    assert!(latest.reachable);
    assert_eq!(latest.latency, Some(Duration::from_millis(7)));
    assert_eq!(latest.detail, "refused");
    let down = reopened
        .most_recent_down_record(1)
        .await
        .expect("query")
        .expect("down record");
    assert_eq!(down.timestamp, record(1, 14, false).timestamp);
    assert!(history.join("ping-2026-02-14.jsonl").exists());
    assert!(history.join("ping-2026-02-15.jsonl").exists());

    let next = reopened.append_ping_record(record(1, 15, true)).await.expect("append");
    assert_eq!(next, 3, "ids continue after the replayed history");

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn deleting_a_device_purges_its_history_on_disk() {
    // Arrange
    let dir = make_temp_dir("cascade");
    let devices = dir.join("devices.json");
    let history = dir.join("history");
    let store = FileStore::open(&devices, &history, 3650).expect("open");
    store.upsert_device(device(1, "10.0.0.1", "a")).await.expect("upsert");
    store.upsert_device(device(2, "10.0.0.2", "b")).await.expect("upsert");
    store.append_ping_record(record(1, 15, true)).await.expect("append");
    store.append_ping_record(record(2, 15, true)).await.expect("append");

    // Act
    store.delete_device(1).await.expect("delete");

    // Assert
    let reopened = FileStore::open(&devices, &history, 3650).expect("reopen");
    assert_eq!(reopened.list_devices().await.expect("list").len(), 1);
    assert!(reopened.most_recent_ping_record(1).await.expect("query").is_none());
    assert!(reopened.most_recent_ping_record(2).await.expect("query").is_some());
    assert_eq!(reopened.next_device_id().expect("next id"), 3);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn reload_picks_up_external_edits() {
    // Arrange
    let dir = make_temp_dir("reload");
    let devices = dir.join("devices.json");
    let store = FileStore::open(&devices, dir.join("history"), 30).expect("open");
    store.upsert_device(Device::new(1, "10.0.0.1", "a")).await.expect("upsert");

    let mut edited = Device::new(2, "10.0.0.2", "b");
    edited.interval_seconds = 60;
    fs::write(&devices, serde_json::to_vec(&vec![edited]).expect("json")).expect("write devices");

    // Act
    let loaded = store.reload_devices().await.expect("reload");

    // Assert
    assert_eq!(loaded.len(), 1);
    assert!(store.get_device(1).await.expect("query").is_none());
    assert_eq!(
        store.get_device(2).await.expect("query").expect("device").interval_seconds,
        60
    );

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn removed_device_id_is_never_handed_out_again() {
    // Arrange: the daemon and the cli each hold a store on the same files
    let dir = make_temp_dir("no-reuse");
    let devices = dir.join("devices.json");
    let history = dir.join("history");
    let daemon = FileStore::open(&devices, &history, 3650).expect("open daemon");
    daemon.upsert_device(device(1, "10.0.0.1", "a")).await.expect("upsert");
    daemon.upsert_device(device(2, "10.0.0.2", "b")).await.expect("upsert");
    let cli = FileStore::open(&devices, &history, 3650).expect("open cli");

    // Act: the cli removes device 2 while the daemon still monitors it
    cli.delete_device(2).await.expect("delete");
    daemon.append_ping_record(record(2, 15, false)).await.expect("late append");
    let new_id = cli.next_device_id().expect("next id");
    let mut added = device(new_id, "10.0.0.3", "c");
    added.created_at = Utc::now();
    cli.upsert_device(added).await.expect("add");

    // Assert
    assert_eq!(new_id, 3);
    let reopened = FileStore::open(&devices, &history, 3650).expect("reopen");
    assert!(reopened.get_device(2).await.expect("query").is_none());
    assert!(reopened.most_recent_ping_record(2).await.expect("query").is_none());
    assert!(reopened.most_recent_ping_record(3).await.expect("query").is_none());
    assert_eq!(reopened.next_device_id().expect("next id"), 4);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn reused_id_does_not_inherit_older_history() {
    // Arrange: the device file is edited by hand and id 1 is recreated
    let dir = make_temp_dir("recreated");
    let devices = dir.join("devices.json");
    let history = dir.join("history");
    {
        let store = FileStore::open(&devices, &history, 3650).expect("open");
        store.upsert_device(device(1, "10.0.0.1", "old")).await.expect("upsert");
        store.append_ping_record(record(1, 14, false)).await.expect("append");
    }
    let recreated = Device::new(1, "10.0.0.50", "new");
    fs::write(&devices, serde_json::to_vec(&vec![recreated]).expect("json")).expect("write devices");

    // Act
    let reopened = FileStore::open(&devices, &history, 3650).expect("reopen");

    // Assert
    assert!(reopened.most_recent_ping_record(1).await.expect("query").is_none());

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn reload_purges_history_of_devices_removed_elsewhere() {
    // Arrange
    let dir = make_temp_dir("reload-purge");
    let devices = dir.join("devices.json");
    let history = dir.join("history");
    let daemon = FileStore::open(&devices, &history, 3650).expect("open");
    daemon.upsert_device(device(1, "10.0.0.1", "a")).await.expect("upsert");
    daemon.upsert_device(device(2, "10.0.0.2", "b")).await.expect("upsert");
    let cli = FileStore::open(&devices, &history, 3650).expect("open cli");
    cli.delete_device(2).await.expect("delete");
    daemon.append_ping_record(record(2, 15, true)).await.expect("late append");

    // Act
    let loaded = daemon.reload_devices().await.expect("reload");

    // Assert
    assert_eq!(loaded.len(), 1);
    let content = fs::read_to_string(history.join("ping-2026-02-15.jsonl")).expect("read history");
    assert!(content.trim().is_empty(), "late record should be purged: {content}");
    assert_eq!(daemon.next_device_id().expect("next id"), 3);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn prune_keeps_going_when_a_file_cannot_be_removed() {
    // Arrange: a directory named like a history file cannot be removed as a file
    let dir = make_temp_dir("unremovable");
    let stuck = dir.join("ping-2025-01-01.jsonl");
    let old_log = dir.join("ping-2025-01-02.jsonl");
    fs::create_dir_all(&stuck).expect("create stuck dir");
    fs::write(&old_log, "old").expect("write old log");

    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 2, 15, 0, 0, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    let result = prune_old_history_files(&dir, 90, now);

    // Assert
    assert!(result.is_ok());
    assert!(stuck.exists());
    assert!(!old_log.exists());

    let _ = fs::remove_dir_all(dir);
}
