use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::repo::{self, AppointmentRow};

/// What a notification needs to show about one upcoming appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingAppointmentView {
    pub id: i64,
    pub time: NaiveTime,
    pub client: String,
    pub pet: String,
    pub phone: Option<String>,
    pub confirmed: bool,
}

impl From<AppointmentRow> for UpcomingAppointmentView {
    fn from(row: AppointmentRow) -> Self {
        Self {
            id: row.id,
            time: row.time,
            client: row.client_display_name(),
            pet: row.dog_name,
            phone: row.phone,
            confirmed: row.confirmed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpcomingScanner {
    store: Store,
    lookahead: Duration,
}

impl UpcomingScanner {
    pub fn new(store: Store, lookahead: Duration) -> Self {
        Self { store, lookahead }
    }

    /// Today's appointments after `now` and no later than `now + lookahead`,
    /// stopping at the end of the day. Errors are logged and yield nothing.
    pub async fn scan_upcoming(&self, now: NaiveDateTime) -> Vec<UpcomingAppointmentView> {
        let after = now.time();
        let until = window_end(after, self.lookahead);
        match repo::appointments_in_window(&self.store, now.date(), after, until).await {
            Ok(rows) => {
                if !rows.is_empty() {
                    tracing::debug!(
                        target: "groombook",
                        event = "upcoming_scan",
                        count = rows.len(),
                        until = %until
                    );
                }
                rows.into_iter().map(UpcomingAppointmentView::from).collect()
            }
            Err(err) => {
                err.log_with_event("upcoming_scan_failed");
                Vec::new()
            }
        }
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// `start + lookahead`, clamped to the last second of the same day.
pub fn window_end(start: NaiveTime, lookahead: Duration) -> NaiveTime {
    let Ok(delta) = TimeDelta::from_std(lookahead) else {
        return end_of_day();
    };
    if delta >= TimeDelta::days(1) {
        return end_of_day();
    }
    let (end, wrapped) = start.overflowing_add_signed(delta);
    if wrapped != 0 {
        end_of_day()
    } else {
        end.min(end_of_day())
    }
}
