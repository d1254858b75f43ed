use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, Row, SqliteConnection};

use crate::db::Store;
use crate::{AppError, AppResult};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewClient {
    pub lastname: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub dog_name: String,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAppointment {
    pub client_id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
}

impl NewAppointment {
    pub fn new(client_id: i64, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            client_id,
            date,
            time,
            confirmed: false,
            status: None,
            comment: None,
            price: None,
        }
    }
}

/// One appointment joined with the client fields the agenda and
/// notifications need.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppointmentRow {
    pub id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub confirmed: bool,
    pub status: Option<String>,
    pub client_id: i64,
    pub lastname: String,
    pub name: String,
    pub dog_name: String,
    pub phone: Option<String>,
}

impl AppointmentRow {
    pub fn client_display_name(&self) -> String {
        format!("{} {}", self.lastname, self.name)
    }
}

const APPOINTMENT_SELECT: &str = "SELECT a.id, a.date, a.time, a.confirmed, a.status, a.client_id, \
     c.lastname, c.name, c.dog_name, c.phone \
     FROM appointments a JOIN clients c ON c.id = a.client_id";

async fn open(store: &Store) -> AppResult<SqliteConnection> {
    store.connect().await
}

async fn close(conn: SqliteConnection) {
    if let Err(err) = conn.close().await {
        tracing::debug!(target: "groombook", event = "db_close_failed", error = %err);
    }
}

pub async fn insert_client(store: &Store, client: &NewClient) -> AppResult<i64> {
    store.maintenance().ensure_idle()?;
    let mut conn = open(store).await?;
    let result = sqlx::query(
        "INSERT INTO clients (lastname, name, address, phone, dog_name, breed, comments) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&client.lastname)
    .bind(&client.name)
    .bind(&client.address)
    .bind(&client.phone)
    .bind(&client.dog_name)
    .bind(&client.breed)
    .bind(&client.comments)
    .execute(&mut conn)
    .await;
    close(conn).await;

    let id = result
        .map_err(|err| AppError::from(err).with_context("operation", "insert_client"))?
        .last_insert_rowid();
    tracing::info!(target: "groombook", event = "client_created", id);
    Ok(id)
}

pub async fn insert_appointment(store: &Store, appointment: &NewAppointment) -> AppResult<i64> {
    store.maintenance().ensure_idle()?;
    let mut conn = open(store).await?;
    let result = sqlx::query(
        "INSERT INTO appointments (date, time, confirmed, status, appoint_comment, price, client_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(appointment.date.format(DATE_FORMAT).to_string())
    .bind(appointment.time.format(TIME_FORMAT).to_string())
    .bind(appointment.confirmed)
    .bind(&appointment.status)
    .bind(&appointment.comment)
    .bind(appointment.price)
    .bind(appointment.client_id)
    .execute(&mut conn)
    .await;
    close(conn).await;

    let id = result
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "insert_appointment")
                .with_context("client_id", appointment.client_id.to_string())
        })?
        .last_insert_rowid();
    tracing::info!(
        target: "groombook",
        event = "appointment_created",
        id,
        date = %appointment.date
    );
    Ok(id)
}

pub async fn delete_appointment(store: &Store, id: i64) -> AppResult<bool> {
    store.maintenance().ensure_idle()?;
    let mut conn = open(store).await?;
    let result = sqlx::query("DELETE FROM appointments WHERE id = ?1")
        .bind(id)
        .execute(&mut conn)
        .await;
    close(conn).await;

    let removed = result
        .map_err(|err| AppError::from(err).with_context("operation", "delete_appointment"))?
        .rows_affected()
        > 0;
    tracing::info!(target: "groombook", event = "appointment_deleted", id, removed);
    Ok(removed)
}

/// Appointments per day-of-month for dates in `[start, end)`.
pub async fn day_counts(
    store: &Store,
    start: NaiveDate,
    end: NaiveDate,
) -> AppResult<BTreeMap<u32, u32>> {
    let mut conn = open(store).await?;
    let rows = sqlx::query(
        "SELECT CAST(strftime('%d', date) AS INTEGER) AS day, COUNT(*) AS total \
         FROM appointments WHERE date >= ?1 AND date < ?2 \
         GROUP BY day ORDER BY day",
    )
    .bind(start.format(DATE_FORMAT).to_string())
    .bind(end.format(DATE_FORMAT).to_string())
    .fetch_all(&mut conn)
    .await;
    close(conn).await;

    let rows = rows.map_err(|err| AppError::from(err).with_context("operation", "day_counts"))?;
    let mut counts = BTreeMap::new();
    for row in rows {
        let day: Option<i64> = row.try_get("day")?;
        let total: i64 = row.try_get("total")?;
        let Some(day) = day.and_then(|d| u32::try_from(d).ok()) else {
            continue;
        };
        counts.insert(day, u32::try_from(total).unwrap_or(u32::MAX));
    }
    Ok(counts)
}

pub async fn appointments_on(store: &Store, date: NaiveDate) -> AppResult<Vec<AppointmentRow>> {
    let sql = format!("{APPOINTMENT_SELECT} WHERE a.date = ?1 ORDER BY a.time, a.id");
    let mut conn = open(store).await?;
    let rows = sqlx::query(&sql)
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_all(&mut conn)
        .await;
    close(conn).await;

    rows.map_err(|err| AppError::from(err).with_context("operation", "appointments_on"))?
        .iter()
        .map(appointment_from_row)
        .collect()
}

/// Appointments on `date` whose time is in `(after, until]`, earliest first.
pub async fn appointments_in_window(
    store: &Store,
    date: NaiveDate,
    after: NaiveTime,
    until: NaiveTime,
) -> AppResult<Vec<AppointmentRow>> {
    if until <= after {
        return Ok(Vec::new());
    }
    let sql = format!(
        "{APPOINTMENT_SELECT} WHERE a.date = ?1 AND a.time > ?2 AND a.time <= ?3 ORDER BY a.time, a.id"
    );
    let mut conn = open(store).await?;
    let rows = sqlx::query(&sql)
        .bind(date.format(DATE_FORMAT).to_string())
        .bind(after.format(TIME_FORMAT).to_string())
        .bind(until.format(TIME_FORMAT).to_string())
        .fetch_all(&mut conn)
        .await;
    close(conn).await;

    rows.map_err(|err| AppError::from(err).with_context("operation", "appointments_in_window"))?
        .iter()
        .map(appointment_from_row)
        .collect()
}

fn appointment_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<AppointmentRow> {
    let raw_date: String = row.try_get("date")?;
    let raw_time: String = row.try_get("time")?;
    let date = NaiveDate::parse_from_str(&raw_date, DATE_FORMAT).map_err(|err| {
        AppError::new("REPO/BAD_DATE", "Stored appointment date is malformed.")
            .with_context("value", raw_date.clone())
            .with_context("error", err.to_string())
    })?;
    let time = NaiveTime::parse_from_str(&raw_time, TIME_FORMAT).map_err(|err| {
        AppError::new("REPO/BAD_TIME", "Stored appointment time is malformed.")
            .with_context("value", raw_time.clone())
            .with_context("error", err.to_string())
    })?;
    let confirmed: Option<i64> = row.try_get("confirmed")?;

    Ok(AppointmentRow {
        id: row.try_get("id")?,
        date,
        time,
        confirmed: confirmed.unwrap_or(0) != 0,
        status: row.try_get("status")?,
        client_id: row.try_get("client_id")?,
        lastname: row.try_get("lastname")?,
        name: row.try_get("name")?,
        dog_name: row.try_get("dog_name")?,
        phone: row.try_get("phone")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    async fn store_with_client() -> (tempfile::TempDir, Store, i64) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("groombook.sqlite3"));
        store.initialize().await.unwrap();
        let client = NewClient {
            lastname: "García".into(),
            name: "Ana".into(),
            phone: Some("600123123".into()),
            dog_name: "Toby".into(),
            ..NewClient::default()
        };
        let id = insert_client(&store, &client).await.unwrap();
        (dir, store, id)
    }

    #[tokio::test]
    async fn counts_group_by_day_within_range() {
        let (_dir, store, client) = store_with_client().await;
        for (d, h) in [(5, 9), (5, 11), (20, 10)] {
            insert_appointment(&store, &NewAppointment::new(client, date(2024, 3, d), time(h, 0)))
                .await
                .unwrap();
        }
        insert_appointment(&store, &NewAppointment::new(client, date(2024, 4, 1), time(9, 0)))
            .await
            .unwrap();

        let counts = day_counts(&store, date(2024, 3, 1), date(2024, 4, 1)).await.unwrap();
        assert_eq!(counts, BTreeMap::from([(5, 2), (20, 1)]));
    }

    #[tokio::test]
    async fn window_is_open_at_start_and_closed_at_end() {
        let (_dir, store, client) = store_with_client().await;
        for h in [10, 11, 12] {
            insert_appointment(&store, &NewAppointment::new(client, date(2024, 3, 5), time(h, 0)))
                .await
                .unwrap();
        }

        let rows = appointments_in_window(&store, date(2024, 3, 5), time(10, 0), time(12, 0))
            .await
            .unwrap();
        let times: Vec<_> = rows.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![time(11, 0), time(12, 0)]);
        assert_eq!(rows[0].client_display_name(), "García Ana");
        assert_eq!(rows[0].dog_name, "Toby");
    }

    #[tokio::test]
    async fn writes_are_rejected_during_maintenance() {
        let (_dir, store, client) = store_with_client().await;
        let _guard = store.maintenance().begin().unwrap();
        let err = insert_appointment(&store, &NewAppointment::new(client, date(2024, 3, 5), time(9, 0)))
            .await
            .expect_err("maintenance active");
        assert_eq!(err.code(), crate::state::DB_MAINTENANCE_ACTIVE_CODE);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (_dir, store, client) = store_with_client().await;
        let id = insert_appointment(&store, &NewAppointment::new(client, date(2024, 3, 5), time(9, 0)))
            .await
            .unwrap();
        assert!(delete_appointment(&store, id).await.unwrap());
        assert!(!delete_appointment(&store, id).await.unwrap());
        assert!(appointments_on(&store, date(2024, 3, 5)).await.unwrap().is_empty());
    }
}
