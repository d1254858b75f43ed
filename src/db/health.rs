use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};

use super::Store;
use crate::AppResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DbHealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: u64,
    /// Advisory checks are reported but never decide the overall status.
    #[serde(default)]
    pub advisory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthReport {
    pub status: DbHealthStatus,
    pub checks: Vec<DbHealthCheck>,
    pub tables_scanned: usize,
    pub rows_scanned: u64,
    pub app_version: String,
    pub generated_at: String,
}

impl DbHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == DbHealthStatus::Ok
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &DbHealthCheck> {
        self.checks.iter().filter(|check| !check.passed && !check.advisory)
    }
}

/// Verify that the live database can be opened and fully read.
///
/// Runs the schema initializer first; an error from it is returned as `Err`
/// and means the file cannot be trusted. Then every table is scanned end to
/// end. A scan failure produces a report with `status == Error`.
pub async fn verify_integrity(store: &Store) -> AppResult<DbHealthReport> {
    let schema_start = Instant::now();
    store.initialize().await?;
    let schema_check = DbHealthCheck {
        name: "schema_init".to_string(),
        passed: true,
        duration_ms: schema_start.elapsed().as_millis() as u64,
        advisory: false,
        details: None,
    };

    let mut conn = store.connect().await?;
    let mut checks = vec![schema_check];

    checks.push(run_quick_check(&mut conn).await);

    let mut tables_scanned = 0;
    let mut rows_scanned = 0;
    match list_tables(&mut conn).await {
        Ok(tables) => {
            for table in tables {
                let (check, rows) = scan_table(&mut conn, &table).await;
                tables_scanned += 1;
                rows_scanned += rows;
                checks.push(check);
            }
        }
        Err(err) => checks.push(DbHealthCheck {
            name: "list_tables".to_string(),
            passed: false,
            duration_ms: 0,
            advisory: false,
            details: Some(err.to_string()),
        }),
    }
    conn.close().await.ok();

    let healthy = checks.iter().all(|check| check.passed || check.advisory);
    let report = DbHealthReport {
        status: if healthy {
            DbHealthStatus::Ok
        } else {
            DbHealthStatus::Error
        },
        checks,
        tables_scanned,
        rows_scanned,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };

    if report.is_healthy() {
        tracing::info!(
            target: "groombook",
            event = "db_integrity_ok",
            tables = report.tables_scanned,
            rows = report.rows_scanned
        );
    } else {
        let failed: Vec<&str> = report.failed_checks().map(|c| c.name.as_str()).collect();
        tracing::warn!(
            target: "groombook",
            event = "db_integrity_failed",
            failed = ?failed
        );
    }

    Ok(report)
}

async fn run_quick_check(conn: &mut SqliteConnection) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck {
        name: "quick_check".to_string(),
        passed: true,
        duration_ms: 0,
        advisory: true,
        details: None,
    };

    match sqlx::query_scalar::<_, String>("PRAGMA quick_check;")
        .fetch_one(&mut *conn)
        .await
    {
        Ok(result) => {
            if !result.eq_ignore_ascii_case("ok") {
                check.passed = false;
                check.details = Some(result);
            }
        }
        Err(err) => {
            check.passed = false;
            check.details = Some(format!("quick_check failed: {err}"));
        }
    }

    check.duration_ms = start.elapsed().as_millis() as u64;
    check
}

async fn list_tables(conn: &mut SqliteConnection) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await
}

async fn scan_table(conn: &mut SqliteConnection, table: &str) -> (DbHealthCheck, u64) {
    let start = Instant::now();
    let sql = format!("SELECT * FROM \"{}\"", table.replace('"', "\"\""));
    let mut rows = 0_u64;
    let mut check = DbHealthCheck {
        name: format!("scan:{table}"),
        passed: true,
        duration_ms: 0,
        advisory: false,
        details: None,
    };

    let mut stream = sqlx::query(&sql).fetch(&mut *conn);
    loop {
        match stream.try_next().await {
            Ok(Some(_)) => rows += 1,
            Ok(None) => break,
            Err(err) => {
                check.passed = false;
                check.details = Some(format!("scan failed after {rows} row(s): {err}"));
                break;
            }
        }
    }
    drop(stream);

    if check.passed {
        check.details = Some(format!("{rows} row(s)"));
    }
    check.duration_ms = start.elapsed().as_millis() as u64;
    (check, rows)
}
