use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::SchedulerConfig;
use crate::db::Store;
use crate::logging::Telemetry;
use crate::poller::{system_clock, Clock, Poller, PollerEvent, PollerState, PollerStatus};
use crate::upcoming::UpcomingAppointmentView;
use crate::util::fence;
use crate::{AppError, AppResult};

pub const ALREADY_STARTED_CODE: &str = "TASKS/ALREADY_STARTED";
const POLLER_THREAD_NAME: &str = "groombook-poller";

/// Handlers run on the thread that owns the [`TaskManager`].
pub struct PollerCallbacks {
    on_upcoming_appointments: Box<dyn FnMut(&[UpcomingAppointmentView])>,
    on_database_changed: Box<dyn FnMut()>,
}

impl PollerCallbacks {
    pub fn new(
        on_upcoming_appointments: impl FnMut(&[UpcomingAppointmentView]) + 'static,
        on_database_changed: impl FnMut() + 'static,
    ) -> Self {
        Self {
            on_upcoming_appointments: Box::new(on_upcoming_appointments),
            on_database_changed: Box::new(on_database_changed),
        }
    }

    fn deliver(&mut self, event: PollerEvent) {
        // A panicking handler is logged by the fence and the next event still runs.
        let _ = match event {
            PollerEvent::DatabaseChanged => fence(|| (self.on_database_changed)()),
            PollerEvent::UpcomingAppointments(list) => {
                fence(|| (self.on_upcoming_appointments)(&list))
            }
        };
    }
}

/// Extra knobs for [`TaskManager::start_with`].
#[derive(Clone)]
pub struct TaskOptions {
    pub telemetry: Telemetry,
    pub clock: Clock,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            telemetry: Telemetry::current(),
            clock: system_clock(),
        }
    }
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    done_rx: Receiver<()>,
    join: JoinHandle<()>,
}

/// Owns the background poller and hands its events to callbacks on the
/// controlling thread.
///
/// Callbacks are not `Send`, so neither is the manager: it stays on the
/// thread that created it and events are only delivered from
/// [`Self::dispatch_pending`] or [`Self::wait_and_dispatch`].
pub struct TaskManager {
    store: Store,
    config: SchedulerConfig,
    callbacks: Option<PollerCallbacks>,
    events: Option<Receiver<PollerEvent>>,
    worker: Option<Worker>,
    /// A worker whose stop timed out. It still counts as the one poller
    /// until its thread reports done.
    draining: Option<Worker>,
    status: PollerStatus,
    telemetry: Telemetry,
}

impl TaskManager {
    pub fn new(store: Store, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            callbacks: None,
            events: None,
            worker: None,
            draining: None,
            status: PollerStatus::new(),
            telemetry: Telemetry::current(),
        }
    }

    pub fn start(&mut self, callbacks: PollerCallbacks) -> AppResult<()> {
        self.start_with(callbacks, TaskOptions::default())
    }

    /// Spawn the poller thread. Fails if a poller from an earlier call is
    /// still attached, or is still finishing after a timed-out stop.
    pub fn start_with(&mut self, callbacks: PollerCallbacks, options: TaskOptions) -> AppResult<()> {
        if self.worker.is_some() {
            return Err(AppError::new(
                ALREADY_STARTED_CODE,
                "Background tasks are already running.",
            ));
        }
        if self.reap_draining() {
            return Err(AppError::new(
                ALREADY_STARTED_CODE,
                "The previous poller has not finished stopping yet.",
            ));
        }

        let (event_tx, event_rx) = mpsc::sync_channel(self.config.event_queue.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let status = PollerStatus::new();
        let poller = Poller::new(
            self.store.clone(),
            self.config.clone(),
            event_tx,
            stop_rx,
            status.clone(),
            options.clock,
        );

        let telemetry = options.telemetry;
        self.telemetry = telemetry.clone();
        let thread_status = status.clone();
        let join = thread::Builder::new()
            .name(POLLER_THREAD_NAME.to_string())
            .spawn(move || {
                // Dropped on every exit path, which is what `stop` waits for.
                let _done = done_tx;
                telemetry.in_scope(|| {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            tracing::error!(
                                target: "groombook",
                                event = "poller_runtime_failed",
                                error = %err
                            );
                            thread_status.set(PollerState::Stopped);
                            return;
                        }
                    };
                    runtime.block_on(poller.run());
                });
            })
            .map_err(|err| AppError::from(err).with_context("operation", "spawn_poller"))?;

        self.callbacks = Some(callbacks);
        self.events = Some(event_rx);
        self.status = status;
        self.worker = Some(Worker {
            stop_tx,
            done_rx,
            join,
        });
        self.telemetry
            .in_scope(|| tracing::info!(target: "groombook", event = "task_manager_started"));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Whether a poller detached by a timed-out stop is still alive.
    pub fn is_draining(&mut self) -> bool {
        self.reap_draining()
    }

    /// Join the detached poller if its thread has finished. Returns whether
    /// it is still running.
    fn reap_draining(&mut self) -> bool {
        let Some(worker) = &self.draining else {
            return false;
        };
        match worker.done_rx.try_recv() {
            Err(TryRecvError::Empty) => true,
            Ok(()) | Err(TryRecvError::Disconnected) => {
                if let Some(worker) = self.draining.take() {
                    self.finish(worker);
                }
                false
            }
        }
    }

    fn finish(&mut self, worker: Worker) {
        let panicked = worker.join.join().is_err();
        self.status.set(PollerState::Stopped);
        self.telemetry.in_scope(|| {
            if panicked {
                tracing::warn!(target: "groombook", event = "poller_thread_panicked");
            }
            tracing::info!(target: "groombook", event = "task_manager_stopped");
        });
    }

    pub fn poller_state(&self) -> PollerState {
        self.status.get()
    }

    /// Deliver every queued event without blocking. Returns how many were
    /// delivered.
    pub fn dispatch_pending(&mut self) -> usize {
        let (Some(events), Some(callbacks)) = (&self.events, &mut self.callbacks) else {
            return 0;
        };
        let mut delivered = 0;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    callbacks.deliver(event);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        delivered
    }

    /// Block up to `timeout` for the first event, then deliver it and
    /// everything else already queued.
    pub fn wait_and_dispatch(&mut self, timeout: Duration) -> usize {
        let (Some(events), Some(callbacks)) = (&self.events, &mut self.callbacks) else {
            return 0;
        };
        match events.recv_timeout(timeout) {
            Ok(event) => callbacks.deliver(event),
            Err(RecvTimeoutError::Timeout) => return 0,
            Err(RecvTimeoutError::Disconnected) => {
                // Nothing will ever arrive; do not spin the caller.
                thread::sleep(timeout);
                return 0;
            }
        }
        1 + self.dispatch_pending()
    }

    /// Ask the poller to finish and wait for it, at most the configured stop
    /// timeout. A poller that overruns is set aside with a warning and blocks
    /// new starts until its thread exits. Calling this again, or on a manager
    /// that never started, does not wait.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            self.reap_draining();
            return;
        };

        self.status.set(PollerState::Stopping);
        let _ = worker.stop_tx.send(true);
        match worker.done_rx.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.finish(worker),
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = self.config.stop_timeout.as_millis() as u64;
                self.telemetry.in_scope(|| {
                    tracing::warn!(
                        target: "groombook",
                        event = "poller_stop_timeout",
                        timeout_ms
                    )
                });
                self.draining = Some(worker);
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop();
    }
}
