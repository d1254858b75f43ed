use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Error carried across every layer of the crate.
///
/// `code` is an `AREA/REASON` string that callers match on (`BACKUP/RESERVED_NAME`,
/// `DB/NOT_A_DATABASE`, ...). `message` is meant for people. `context` holds
/// the paths, operations and counters that explain where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

/// SQLite primary result codes that mean the file itself cannot be trusted.
const STORAGE_FAULT_CODES: &[&str] = &["DB/CORRUPT", "DB/NOT_A_DATABASE", "DB/CANT_OPEN"];

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";
    pub const PANIC_CODE: &'static str = "RUNTIME/PANIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn panic(payload: &(dyn Any + Send)) -> Self {
        AppError::new(Self::PANIC_CODE, panic_payload(payload))
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// True when this error, or anything in its cause chain, says the
    /// database file is damaged or not a database at all.
    pub fn is_storage_fault(&self) -> bool {
        STORAGE_FAULT_CODES.contains(&self.code.as_str())
            || self.cause().is_some_and(AppError::is_storage_fault)
    }

    /// Emit the error as one structured record under `event`.
    pub fn log_with_event(&self, event: &'static str) {
        let cause = self.cause().map(|c| c.code.as_str()).unwrap_or("-");
        tracing::error!(
            target: "groombook",
            event = event,
            code = %self.code,
            message = %self.message,
            cause = %cause,
            context = ?self.context,
        );
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, " (")?;
            for (i, (key, value)) in pairs.into_iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Render a panic payload as text.
pub fn panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Map a SQLite result code (primary or extended) to an error code.
fn sqlite_code(raw: i32) -> String {
    match raw & 0xff {
        5 => "DB/BUSY".into(),
        6 => "DB/LOCKED".into(),
        8 => "DB/READ_ONLY".into(),
        10 => "DB/IO".into(),
        11 => "DB/CORRUPT".into(),
        13 => "DB/DISK_FULL".into(),
        14 => "DB/CANT_OPEN".into(),
        19 => "DB/CONSTRAINT".into(),
        26 => "DB/NOT_A_DATABASE".into(),
        other => format!("DB/SQLITE_{other}"),
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        fn walk(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
                return database_error(sqlx_err);
            }
            let mut converted = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                converted.cause = Some(Box::new(walk(source)));
            }
            converted
        }

        walk(error.as_ref())
    }
}

impl From<io::Error> for AppError {
    fn from(error: io::Error) -> Self {
        let converted = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        match error.raw_os_error() {
            Some(os_code) => converted.with_context("os_code", os_code.to_string()),
            None => converted,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::new("JSON/INVALID", error.to_string())
            .with_context("line", error.line().to_string())
    }
}

fn database_error(error: &sqlx::Error) -> AppError {
    match error {
        sqlx::Error::RowNotFound => AppError::new("DB/ROW_NOT_FOUND", "Record not found"),
        sqlx::Error::ColumnNotFound(name) => {
            AppError::new("DB/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            AppError::new("DB/DECODE", source.to_string()).with_context("column", index.clone())
        }
        sqlx::Error::Database(db) => {
            let code = db
                .code()
                .and_then(|raw| raw.parse::<i32>().ok())
                .map(sqlite_code)
                .unwrap_or_else(|| "DB/ERROR".to_string());
            AppError::new(code, db.message().to_string())
        }
        other => AppError::new("DB/ERROR", other.to_string()),
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            other => database_error(&other),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(ffi, _) => {
                AppError::new(sqlite_code(ffi.extended_code), error.to_string())
                    .with_context("extended_code", ffi.extended_code.to_string())
            }
            _ => AppError::new("DB/ERROR", error.to_string()).with_context("source", "rusqlite"),
        }
    }
}
