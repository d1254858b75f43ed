use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::sync::watch;

use crate::change_detector::ChangeDetector;
use crate::config::SchedulerConfig;
use crate::db::Store;
use crate::upcoming::{UpcomingAppointmentView, UpcomingScanner};
use crate::util::fenced_cycle;
use crate::{AppError, AppResult};

/// Source of local wall-clock time for the poller.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PollerEvent {
    DatabaseChanged,
    UpcomingAppointments(Vec<UpcomingAppointmentView>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Shared view of a poller's lifecycle.
#[derive(Debug, Clone)]
pub struct PollerStatus(Arc<Mutex<PollerState>>);

impl PollerStatus {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(PollerState::Created)))
    }

    pub fn get(&self) -> PollerState {
        *self.0.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn set(&self, state: PollerState) {
        *self.0.lock().unwrap_or_else(|err| err.into_inner()) = state;
    }
}

impl Default for PollerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// The background loop: detect changes, scan for upcoming appointments,
/// queue events, sleep.
pub struct Poller {
    store: Store,
    config: SchedulerConfig,
    detector: ChangeDetector,
    scanner: UpcomingScanner,
    events: SyncSender<PollerEvent>,
    stop: watch::Receiver<bool>,
    status: PollerStatus,
    clock: Clock,
}

impl Poller {
    pub fn new(
        store: Store,
        config: SchedulerConfig,
        events: SyncSender<PollerEvent>,
        stop: watch::Receiver<bool>,
        status: PollerStatus,
        clock: Clock,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(store.clone(), config.change_interval),
            scanner: UpcomingScanner::new(store.clone(), config.lookahead),
            store,
            config,
            events,
            stop,
            status,
            clock,
        }
    }

    /// Run cycles until the stop signal is raised or its sender is dropped.
    pub async fn run(mut self) {
        self.status.set(PollerState::Running);
        tracing::info!(
            target: "groombook",
            event = "poller_started",
            interval_ms = self.config.change_interval.as_millis() as u64
        );

        loop {
            if self.stop_requested() {
                break;
            }
            let pause = match fenced_cycle(|| self.run_cycle()).await {
                Ok(()) => self.config.change_interval,
                Err(err) => {
                    err.log_with_event("poller_cycle_failed");
                    self.config.backoff_interval()
                }
            };
            if self.sleep_or_stop(pause).await {
                break;
            }
        }

        self.status.set(PollerState::Stopping);
        tracing::info!(target: "groombook", event = "poller_stopping");
        self.status.set(PollerState::Stopped);
        tracing::info!(target: "groombook", event = "poller_stopped");
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    async fn run_cycle(&mut self) -> AppResult<()> {
        if self.store.maintenance().is_active() {
            tracing::debug!(target: "groombook", event = "poller_cycle_skipped_maintenance");
            return Ok(());
        }

        let now = (self.clock)();
        if self.detector.check(now.date(), Instant::now()).await {
            self.emit(PollerEvent::DatabaseChanged)?;
        }

        let upcoming = self.scanner.scan_upcoming(now).await;
        if !upcoming.is_empty() {
            let count = upcoming.len();
            self.emit(PollerEvent::UpcomingAppointments(upcoming))?;
            tracing::info!(target: "groombook", event = "upcoming_appointments_queued", count);
        }
        Ok(())
    }

    fn emit(&self, event: PollerEvent) -> AppResult<()> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    target: "groombook",
                    event = "poller_event_dropped",
                    reason = "queue_full",
                    kind = event_kind(&dropped)
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(AppError::new(
                "POLLER/RECEIVER_GONE",
                "Nobody is listening for poller events.",
            )),
        }
    }

    /// Sleep for `pause`, waking early on a stop request. Returns whether the
    /// poller should exit.
    async fn sleep_or_stop(&mut self, pause: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(pause) => self.stop_requested(),
            changed = self.stop.changed() => changed.is_err() || self.stop_requested(),
        }
    }
}

fn event_kind(event: &PollerEvent) -> &'static str {
    match event {
        PollerEvent::DatabaseChanged => "database_changed",
        PollerEvent::UpcomingAppointments(_) => "upcoming_appointments",
    }
}
