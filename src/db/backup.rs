use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::available_space;
use serde::Serialize;
use tokio::task;

use super::swap::{self, Sidecars};
use super::Store;
use crate::config::{AppPaths, BackupConfig};
use crate::{AppError, AppResult};

pub const RESERVED_NAME_CODE: &str = "BACKUP/RESERVED_NAME";
pub const SOURCE_MISSING_CODE: &str = "BACKUP/SOURCE_MISSING";
pub const NO_AUTO_BACKUP_CODE: &str = "BACKUP/NO_AUTO_BACKUP";
pub const RESTORE_EXHAUSTED_CODE: &str = "BACKUP/RESTORE_EXHAUSTED";
pub const LOW_DISK_CODE: &str = "BACKUP/LOW_DISK";

const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;

/// A backup file and the moment it was taken, read from file metadata.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    store: Store,
    auto_backup_path: PathBuf,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(store: Store, auto_backup_path: impl Into<PathBuf>, config: BackupConfig) -> Self {
        Self {
            store,
            auto_backup_path: auto_backup_path.into(),
            config,
        }
    }

    pub fn from_paths(store: Store, paths: &AppPaths, config: BackupConfig) -> Self {
        Self::new(store, paths.auto_backup_path(), config)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn auto_backup_path(&self) -> &Path {
        &self.auto_backup_path
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Copy `source` to `dest`. A `dest` named like the live database is
    /// refused before anything on disk is looked at.
    pub async fn backup(&self, source: &Path, dest: &Path) -> AppResult<u64> {
        self.reject_reserved(dest, "backup")?;
        let _guard = self.store.maintenance().begin()?;

        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let bytes = run_blocking("backup", {
            let source = source.clone();
            let dest = dest.clone();
            move || backup_sync(&source, &dest)
        })
        .await
        .map_err(|err| {
            err.with_context("from", source.display().to_string())
                .with_context("to", dest.display().to_string())
        })?;

        tracing::info!(
            target: "groombook",
            event = "backup_created",
            from = %source.display(),
            to = %dest.display(),
            bytes
        );
        Ok(bytes)
    }

    /// Copy `source` over `dest`. A `source` named like the live database is
    /// refused before anything on disk is looked at.
    pub async fn restore(&self, source: &Path, dest: &Path) -> AppResult<u64> {
        self.reject_reserved(source, "restore")?;
        let _guard = self.store.maintenance().begin()?;

        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let bytes = run_blocking("restore", {
            let source = source.clone();
            let dest = dest.clone();
            move || {
                ensure_source(&source)?;
                swap::copy_atomic(&source, &dest, Sidecars::Clear)
            }
        })
        .await
        .map_err(|err| {
            err.with_context("from", source.display().to_string())
                .with_context("to", dest.display().to_string())
        })?;

        tracing::info!(
            target: "groombook",
            event = "backup_restored",
            from = %source.display(),
            to = %dest.display(),
            bytes
        );
        Ok(bytes)
    }

    /// Refresh the auto-backup from the live store after a short settle delay.
    /// Failures are logged and reported as `false`; they never abort startup.
    pub async fn create_auto_backup(&self) -> bool {
        tokio::time::sleep(self.config.auto_backup_delay).await;
        match self
            .backup(self.store.db_path(), &self.auto_backup_path)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    target: "groombook",
                    event = "auto_backup_refreshed",
                    path = %self.auto_backup_path.display()
                );
                true
            }
            Err(err) => {
                err.log_with_event("auto_backup_failed");
                false
            }
        }
    }

    /// Replace the live store with the auto-backup and bring its schema up to
    /// date. Returns when the auto-backup was taken.
    pub async fn restore_from_auto_backup(&self) -> AppResult<BackupRecord> {
        let auto = self.auto_backup_path.clone();
        if !auto.exists() {
            return Err(no_auto_backup(&auto));
        }

        let guard = self.store.maintenance().begin()?;
        let live = self.store.db_path().to_path_buf();
        let created_at = run_blocking("restore_auto_backup", {
            let auto = auto.clone();
            move || {
                ensure_source(&auto)?;
                let created_at = swap::file_created_at(&auto)?;
                swap::copy_atomic(&auto, &live, Sidecars::Clear)?;
                Ok(created_at)
            }
        })
        .await?;
        drop(guard);

        self.store
            .initialize()
            .await
            .map_err(|err| err.with_context("operation", "reinitialize_restored_db"))?;

        tracing::info!(
            target: "groombook",
            event = "auto_backup_restored",
            path = %auto.display(),
            created_at = %created_at.to_rfc3339()
        );
        Ok(BackupRecord {
            path: auto,
            created_at,
        })
    }

    /// Retry [`Self::restore_from_auto_backup`] up to `max_attempts` times,
    /// sleeping `delay` between failures. Gives up at once when there is no
    /// auto-backup to restore from.
    pub async fn try_restore_database(
        &self,
        max_attempts: u32,
        delay: Duration,
    ) -> AppResult<BackupRecord> {
        if !self.auto_backup_path.exists() {
            let err = no_auto_backup(&self.auto_backup_path);
            err.log_with_event("restore_no_auto_backup");
            return Err(err);
        }

        let attempts = max_attempts.max(1);
        let mut last_error: Option<AppError> = None;
        for attempt in 1..=attempts {
            match self.restore_from_auto_backup().await {
                Ok(record) => {
                    tracing::info!(
                        target: "groombook",
                        event = "restore_attempt_succeeded",
                        attempt,
                        attempts
                    );
                    return Ok(record);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "groombook",
                        event = "restore_attempt_failed",
                        attempt,
                        attempts,
                        code = %err.code(),
                        error = %err
                    );
                    let missing = err.code() == NO_AUTO_BACKUP_CODE;
                    last_error = Some(err);
                    if missing {
                        break;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let mut err = AppError::new(
            RESTORE_EXHAUSTED_CODE,
            "The database could not be restored from the automatic backup.",
        )
        .with_context("attempts", attempts.to_string());
        if let Some(cause) = last_error {
            err = err.with_cause(cause);
        }
        Err(err)
    }

    fn reject_reserved(&self, path: &Path, operation: &str) -> AppResult<()> {
        let Some(reserved) = self.store.db_path().file_name() else {
            return Ok(());
        };
        if swap::has_file_name(path, reserved) {
            let err = AppError::new(
                RESERVED_NAME_CODE,
                format!(
                    "A backup file cannot be named {}. Choose a different name.",
                    reserved.to_string_lossy()
                ),
            )
            .with_context("operation", operation.to_string())
            .with_context("path", path.display().to_string());
            tracing::warn!(
                target: "groombook",
                event = "backup_reserved_name_rejected",
                operation,
                path = %path.display()
            );
            return Err(err);
        }
        Ok(())
    }
}

async fn run_blocking<T, F>(operation: &'static str, f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f).await.map_err(|err| {
        AppError::new("BACKUP/TASK", "Backup task panicked")
            .with_context("operation", operation)
            .with_context("error", err.to_string())
    })?
}

fn backup_sync(source: &Path, dest: &Path) -> AppResult<u64> {
    ensure_source(source)?;
    let size = fs::metadata(source).map(|meta| meta.len()).unwrap_or(0);
    ensure_free_space(dest, size)?;
    swap::checkpoint_wal(source)?;
    swap::copy_atomic(source, dest, Sidecars::Keep)
}

fn ensure_source(source: &Path) -> AppResult<()> {
    if source.is_file() {
        return Ok(());
    }
    Err(AppError::new(
        SOURCE_MISSING_CODE,
        "The file to copy from does not exist.",
    )
    .with_context("path", source.display().to_string()))
}

fn no_auto_backup(path: &Path) -> AppError {
    AppError::new(NO_AUTO_BACKUP_CODE, "No automatic backup is available.")
        .with_context("path", path.display().to_string())
}

fn required_free_bytes(size: u64) -> u64 {
    (size as f64 * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn ensure_free_space(dest: &Path, size: u64) -> AppResult<()> {
    let target = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    // A missing directory surfaces as a clearer error from the copy itself.
    let Ok(available) = available_space(&target) else {
        return Ok(());
    };
    let required = required_free_bytes(size);
    if available < required {
        return Err(AppError::new(
            LOW_DISK_CODE,
            format!(
                "Not enough disk space for a backup: {} needed, {} available.",
                format_bytes(required),
                format_bytes(available)
            ),
        )
        .with_context("path", target.display().to_string()));
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    let mb = (bytes as f64) / 1_000_000.0;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}
