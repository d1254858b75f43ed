use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::backup::BackupManager;
use crate::db::health::{self, DbHealthReport};
use crate::AppError;
use crate::AppResult;

pub const UNRECOVERABLE_CODE: &str = "STARTUP/UNRECOVERABLE";

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub health: DbHealthReport,
    /// When the auto-backup used for recovery was taken, if one was needed.
    pub restored_from: Option<DateTime<Utc>>,
    pub auto_backup_refreshed: bool,
}

/// Make the live store safe to use: initialize the schema, verify every table
/// can be read, recover from the auto-backup if not, then refresh the
/// auto-backup. An error means the process cannot continue.
pub async fn prepare_store(backups: &BackupManager) -> AppResult<StartupReport> {
    let store = backups.store();
    let mut restored_from = None;

    let health = match verified(health::verify_integrity(store).await) {
        Ok(report) => report,
        Err(err) => {
            err.log_with_event("startup_integrity_failed");
            tracing::warn!(
                target: "groombook",
                event = "startup_restore_begin",
                storage_fault = err.is_storage_fault()
            );
            let config = backups.config();
            let record = backups
                .try_restore_database(config.restore_attempts, config.restore_delay)
                .await
                .map_err(|restore_err| {
                    unrecoverable(restore_err.with_context("integrity_error", err.to_string()))
                })?;
            restored_from = Some(record.created_at);

            verified(health::verify_integrity(store).await).map_err(unrecoverable)?
        }
    };

    let auto_backup_refreshed = backups.create_auto_backup().await;

    tracing::info!(
        target: "groombook",
        event = "startup_complete",
        restored = restored_from.is_some(),
        auto_backup_refreshed
    );
    Ok(StartupReport {
        health,
        restored_from,
        auto_backup_refreshed,
    })
}

fn verified(outcome: AppResult<DbHealthReport>) -> AppResult<DbHealthReport> {
    let report = outcome?;
    if report.is_healthy() {
        return Ok(report);
    }
    let failed: Vec<String> = report.failed_checks().map(|c| c.name.clone()).collect();
    Err(AppError::new("DB/CORRUPT", "The database failed its integrity check.")
        .with_context("failed_checks", failed.join(",")))
}

fn unrecoverable(cause: AppError) -> AppError {
    let err = AppError::new(
        UNRECOVERABLE_CODE,
        "The database is damaged and could not be restored from the automatic backup.",
    )
    .with_cause(cause);
    err.log_with_event("startup_unrecoverable");
    err
}
