#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveTime};
use tempfile::TempDir;
use tracing::Dispatch;
use tracing_subscriber::{fmt, EnvFilter};

use groombook_lib::config::BackupConfig;
use groombook_lib::db::backup::BackupManager;
use groombook_lib::db::Store;
use groombook_lib::repo::{self, NewAppointment, NewClient};
use groombook_lib::Telemetry;

pub const DB_FILE: &str = "groombook.sqlite3";
pub const AUTO_BACKUP_FILE: &str = "groombook.autobackup.sqlite3";

pub async fn temp_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join(DB_FILE));
    store.initialize().await.expect("initialize store");
    (dir, store)
}

pub fn backup_manager(dir: &Path, store: &Store) -> BackupManager {
    let config = BackupConfig {
        auto_backup_delay: std::time::Duration::ZERO,
        restore_attempts: 3,
        restore_delay: std::time::Duration::from_millis(10),
    };
    BackupManager::new(store.clone(), dir.join(AUTO_BACKUP_FILE), config)
}

pub async fn add_client(store: &Store, lastname: &str, name: &str, dog: &str) -> i64 {
    repo::insert_client(
        store,
        &NewClient {
            lastname: lastname.into(),
            name: name.into(),
            dog_name: dog.into(),
            phone: Some("600000000".into()),
            ..NewClient::default()
        },
    )
    .await
    .expect("insert client")
}

pub async fn book(store: &Store, client: i64, date: NaiveDate, time: NaiveTime) -> i64 {
    repo::insert_appointment(store, &NewAppointment::new(client, date, time))
        .await
        .expect("insert appointment")
}

pub fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Overwrite a database file with bytes SQLite will refuse to open.
pub fn corrupt(path: &Path) {
    std::fs::write(path, vec![0x5a_u8; 16 * 1024]).unwrap();
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(sidecar);
    }
}

pub struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A telemetry handle whose JSON output lands in the returned buffer.
pub fn buffer_telemetry() -> (Arc<Mutex<Vec<u8>>>, Telemetry) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = buffer.clone();
    let subscriber = fmt()
        .with_env_filter(EnvFilter::new("groombook=debug"))
        .with_writer(move || BufferWriter(writer.clone()))
        .json()
        .flatten_event(true)
        .finish();
    (buffer, Telemetry::from_dispatch(Dispatch::new(subscriber)))
}

pub fn log_events(buffer: &Arc<Mutex<Vec<u8>>>) -> Vec<serde_json::Value> {
    let raw = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

pub fn count_events(buffer: &Arc<Mutex<Vec<u8>>>, name: &str) -> usize {
    log_events(buffer)
        .iter()
        .filter(|value| value.get("event").and_then(|e| e.as_str()) == Some(name))
        .count()
}
