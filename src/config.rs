use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AppError, AppResult};

/// Filename of the live database. Backups and restores refuse to shadow it.
pub const DB_FILE_NAME: &str = "groombook.sqlite3";
/// Filename of the automatically maintained backup, colocated with the live file.
pub const AUTO_BACKUP_FILE_NAME: &str = "groombook.autobackup.sqlite3";
const APP_DIR_NAME: &str = "groombook";
const LOGS_DIR_NAME: &str = "logs";

const DEFAULT_CHANGE_INTERVAL_SECS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOOKAHEAD_MINUTES: u64 = 120;
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_EVENT_QUEUE: usize = 64;
const HARD_MAX_INTERVAL_SECS: u64 = 3_600;
const HARD_MAX_LOOKAHEAD_MINUTES: u64 = 24 * 60;
const HARD_MAX_BACKOFF_MULTIPLIER: u32 = 10;
const HARD_MAX_STOP_TIMEOUT_MS: u64 = 60_000;
const HARD_MAX_EVENT_QUEUE: usize = 4_096;

const DEFAULT_AUTO_BACKUP_DELAY_MS: u64 = 1_000;
const DEFAULT_RESTORE_ATTEMPTS: u32 = 3;
const DEFAULT_RESTORE_DELAY_MS: u64 = 1_000;
const HARD_MAX_DELAY_MS: u64 = 60_000;
const HARD_MAX_RESTORE_ATTEMPTS: u32 = 20;

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}

/// On-disk locations derived from the application data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Resolve the data directory, honouring `GROOMBOOK_FAKE_APPDATA` for tests.
    pub fn resolve() -> AppResult<Self> {
        if let Ok(fake) = env::var("GROOMBOOK_FAKE_APPDATA") {
            return Ok(Self::new(fake));
        }
        let base = dirs::data_dir()
            .or_else(|| env::current_dir().ok())
            .ok_or_else(|| {
                AppError::new(
                    "CONFIG/NO_DATA_DIR",
                    "Failed to resolve application data directory",
                )
            })?;
        Ok(Self::new(base.join(APP_DIR_NAME)))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn auto_backup_path(&self) -> PathBuf {
        self.data_dir.join(AUTO_BACKUP_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR_NAME)
    }
}

/// Cadences for the background poller and the controlling context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Poller sleep between cycles and the change detector's rate limit.
    pub change_interval: Duration,
    /// How often the controlling context refreshes its views unprompted.
    pub refresh_interval: Duration,
    /// Upcoming-appointment window measured from "now".
    pub lookahead: Duration,
    /// A failed cycle sleeps `change_interval * backoff_multiplier`.
    pub backoff_multiplier: u32,
    /// Upper bound on how long `stop()` waits for the poller thread.
    pub stop_timeout: Duration,
    /// Capacity of the poller to controlling-context queue.
    pub event_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            change_interval: Duration::from_secs(DEFAULT_CHANGE_INTERVAL_SECS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            lookahead: Duration::from_secs(DEFAULT_LOOKAHEAD_MINUTES * 60),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            event_queue: DEFAULT_EVENT_QUEUE,
        }
    }
}

impl SchedulerConfig {
    pub fn load() -> Self {
        let defaults = Self::default();

        let change_interval = env_u64("GROOMBOOK_CHANGE_INTERVAL_SECS")
            .filter(|value| *value > 0)
            .map(|value| Duration::from_secs(value.min(HARD_MAX_INTERVAL_SECS)))
            .unwrap_or(defaults.change_interval);

        let refresh_interval = env_u64("GROOMBOOK_REFRESH_INTERVAL_SECS")
            .filter(|value| *value > 0)
            .map(|value| Duration::from_secs(value.min(HARD_MAX_INTERVAL_SECS)))
            .unwrap_or(defaults.refresh_interval);

        let lookahead = env_u64("GROOMBOOK_LOOKAHEAD_MINUTES")
            .filter(|value| *value > 0)
            .map(|value| Duration::from_secs(value.min(HARD_MAX_LOOKAHEAD_MINUTES) * 60))
            .unwrap_or(defaults.lookahead);

        let backoff_multiplier = env_u64("GROOMBOOK_BACKOFF_MULTIPLIER")
            .and_then(|value| u32::try_from(value).ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_BACKOFF_MULTIPLIER))
            .unwrap_or(defaults.backoff_multiplier);

        let stop_timeout = env_u64("GROOMBOOK_STOP_TIMEOUT_MS")
            .map(|value| Duration::from_millis(value.min(HARD_MAX_STOP_TIMEOUT_MS)))
            .unwrap_or(defaults.stop_timeout);

        let event_queue = env_u64("GROOMBOOK_EVENT_QUEUE")
            .and_then(|value| usize::try_from(value).ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_EVENT_QUEUE))
            .unwrap_or(defaults.event_queue);

        Self {
            change_interval,
            refresh_interval,
            lookahead,
            backoff_multiplier,
            stop_timeout,
            event_queue,
        }
    }

    pub fn backoff_interval(&self) -> Duration {
        self.change_interval
            .saturating_mul(self.backoff_multiplier.max(1))
    }
}

/// Timings for the auto-backup and the bounded-retry restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub auto_backup_delay: Duration,
    pub restore_attempts: u32,
    pub restore_delay: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            auto_backup_delay: Duration::from_millis(DEFAULT_AUTO_BACKUP_DELAY_MS),
            restore_attempts: DEFAULT_RESTORE_ATTEMPTS,
            restore_delay: Duration::from_millis(DEFAULT_RESTORE_DELAY_MS),
        }
    }
}

impl BackupConfig {
    pub fn load() -> Self {
        let defaults = Self::default();

        let auto_backup_delay = env_u64("GROOMBOOK_AUTO_BACKUP_DELAY_MS")
            .map(|value| Duration::from_millis(value.min(HARD_MAX_DELAY_MS)))
            .unwrap_or(defaults.auto_backup_delay);

        let restore_attempts = env_u64("GROOMBOOK_RESTORE_ATTEMPTS")
            .and_then(|value| u32::try_from(value).ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_RESTORE_ATTEMPTS))
            .unwrap_or(defaults.restore_attempts);

        let restore_delay = env_u64("GROOMBOOK_RESTORE_DELAY_MS")
            .map(|value| Duration::from_millis(value.min(HARD_MAX_DELAY_MS)))
            .unwrap_or(defaults.restore_delay);

        Self {
            auto_backup_delay,
            restore_attempts,
            restore_delay,
        }
    }
}
