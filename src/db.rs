use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};

use crate::state::MaintenanceFlag;
use crate::{AppError, AppResult};

pub mod backup;
pub mod health;
pub mod swap;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle on the live database file.
///
/// Cheap to clone. Every operation opens its own short-lived connection and
/// closes it before returning, so handles can be used from the poller thread
/// and the controlling context at the same time.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: Arc<PathBuf>,
    maintenance: MaintenanceFlag,
}

impl Store {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Arc::new(db_path.into()),
            maintenance: MaintenanceFlag::new(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn maintenance(&self) -> &MaintenanceFlag {
        &self.maintenance
    }

    fn connect_options(&self, create_if_missing: bool) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(self.db_path.as_path())
            .create_if_missing(create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .log_statements(log::LevelFilter::Off)
    }

    /// Open a connection to an existing database file.
    pub async fn connect(&self) -> AppResult<SqliteConnection> {
        self.connect_options(false).connect().await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_db")
                .with_context("path", self.db_path.display().to_string())
        })
    }

    /// Create the database file if needed and bring its schema up to date.
    pub async fn initialize(&self) -> AppResult<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_db_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }

        let mut conn = self.connect_options(true).connect().await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_db_for_init")
                .with_context("path", self.db_path.display().to_string())
        })?;
        let result = crate::migrate::apply_migrations(&mut conn).await;
        conn.close().await.ok();
        result.map_err(|err| AppError::from(err).with_context("operation", "apply_migrations"))?;

        tracing::info!(
            target: "groombook",
            event = "db_initialized",
            path = %self.db_path.display()
        );
        Ok(())
    }
}
