use std::time::{Duration, Instant};

use chrono::NaiveDate;

use crate::db::Store;
use crate::repo;
use crate::snapshot::{DaySnapshot, WatchedState, YearMonth};
use crate::{AppError, AppResult};

/// Compare the per-day appointment counts of the watched months against the
/// last observed values.
#[derive(Debug)]
pub struct ChangeDetector {
    store: Store,
    min_interval: Duration,
    state: Option<WatchedState>,
    last_compared: Option<Instant>,
}

impl ChangeDetector {
    pub fn new(store: Store, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
            state: None,
            last_compared: None,
        }
    }

    pub fn state(&self) -> Option<&WatchedState> {
        self.state.as_ref()
    }

    /// Returns `true` when the watched months differ from the last successful
    /// observation. The first successful call only records a baseline. Calls
    /// closer together than the minimum interval return `false` without
    /// touching the store.
    pub async fn check(&mut self, today: NaiveDate, now: Instant) -> bool {
        if let Some(last) = self.last_compared {
            if now.saturating_duration_since(last) < self.min_interval {
                tracing::debug!(target: "groombook", event = "change_check_rate_limited");
                return false;
            }
        }

        let fresh = match capture(&self.store, today).await {
            Ok(fresh) => fresh,
            Err(err) => {
                err.log_with_event("change_check_failed");
                return false;
            }
        };
        self.last_compared = Some(now);

        match &self.state {
            Some(previous) if !previous.differs_from(&fresh) => false,
            Some(_) => {
                tracing::info!(
                    target: "groombook",
                    event = "database_change_detected",
                    month = %fresh.current_month.month()
                );
                self.state = Some(fresh);
                true
            }
            None => {
                self.state = Some(fresh);
                false
            }
        }
    }
}

/// Per-day counts for `month`. A failed query is logged and yields an empty
/// snapshot.
pub async fn compute_snapshot(store: &Store, month: YearMonth) -> DaySnapshot {
    match try_compute_snapshot(store, month).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            err.log_with_event("snapshot_query_failed");
            DaySnapshot::empty(month)
        }
    }
}

async fn try_compute_snapshot(store: &Store, month: YearMonth) -> AppResult<DaySnapshot> {
    let (Some(start), Some(end)) = (month.first_day(), month.next().first_day()) else {
        return Err(AppError::new("SNAPSHOT/BAD_MONTH", "Month is out of range.")
            .with_context("month", month.to_string()));
    };
    let counts = repo::day_counts(store, start, end)
        .await
        .map_err(|err| err.with_context("month", month.to_string()))?;
    Ok(DaySnapshot::new(month, counts))
}

/// Both watched months, or the first query error. Unlike
/// [`compute_snapshot`], a failure here is not folded into an empty value so
/// the detector can tell "no appointments" from "could not look".
pub async fn capture(store: &Store, today: NaiveDate) -> AppResult<WatchedState> {
    let current = YearMonth::of(today);
    Ok(WatchedState {
        current_month: try_compute_snapshot(store, current).await?,
        next_month: try_compute_snapshot(store, current.next()).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{NewAppointment, NewClient};
    use chrono::NaiveTime;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    async fn setup() -> (tempfile::TempDir, Store, i64) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("groombook.sqlite3"));
        store.initialize().await.unwrap();
        let client = repo::insert_client(
            &store,
            &NewClient {
                lastname: "Pérez".into(),
                name: "Luis".into(),
                dog_name: "Rocky".into(),
                ..NewClient::default()
            },
        )
        .await
        .unwrap();
        (dir, store, client)
    }

    async fn book(store: &Store, client: i64, date: NaiveDate) {
        let at = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        repo::insert_appointment(store, &NewAppointment::new(client, date, at))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_store_yields_empty_snapshot() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("absent.sqlite3"));
        let month = YearMonth::new(2024, 3).unwrap();
        assert_eq!(compute_snapshot(&store, month).await, DaySnapshot::empty(month));
    }

    #[tokio::test]
    async fn detects_new_appointment_once() {
        let (_dir, store, client) = setup().await;
        book(&store, client, day(5)).await;
        book(&store, client, day(5)).await;

        let interval = Duration::from_secs(30);
        let mut detector = ChangeDetector::new(store.clone(), interval);
        let t0 = Instant::now();
        assert!(!detector.check(day(1), t0).await, "first check is the baseline");
        assert_eq!(detector.state().unwrap().current_month.count_for(5), 2);

        book(&store, client, day(5)).await;
        assert!(!detector.check(day(1), t0 + Duration::from_secs(1)).await, "rate limited");
        assert!(detector.check(day(1), t0 + interval).await);
        assert_eq!(detector.state().unwrap().current_month.count_for(5), 3);
        assert!(!detector.check(day(1), t0 + interval * 2).await);
    }

    #[tokio::test]
    async fn next_month_changes_are_watched() {
        let (_dir, store, client) = setup().await;
        let mut detector = ChangeDetector::new(store.clone(), Duration::ZERO);
        let t0 = Instant::now();
        detector.check(day(31), t0).await;

        book(&store, client, NaiveDate::from_ymd_opt(2024, 4, 2).unwrap()).await;
        assert!(detector.check(day(31), t0).await);
    }

    #[tokio::test]
    async fn failed_query_keeps_previous_state() {
        let (dir, store, _client) = setup().await;
        let mut detector = ChangeDetector::new(store.clone(), Duration::ZERO);
        let t0 = Instant::now();
        detector.check(day(1), t0).await;
        let before = detector.state().cloned();

        std::fs::remove_file(store.db_path()).unwrap();
        let _ = crate::db::swap::remove_sidecars(store.db_path());
        assert!(!detector.check(day(1), t0).await);
        assert_eq!(detector.state().cloned(), before);
        drop(dir);
    }
}
