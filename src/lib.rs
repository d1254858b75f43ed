//! Appointment book back end for a pet-grooming salon.
//!
//! The interesting parts are the background poller ([`task_manager`],
//! [`poller`]) that notices new bookings and imminent appointments, and the
//! backup subsystem ([`db::backup`], [`startup`]) that keeps an automatic copy
//! of the database and restores it when the live file is unreadable.

pub mod change_detector;
pub mod config;
pub mod db;
mod error;
pub mod logging;
mod migrate;
pub mod poller;
pub mod repo;
pub mod snapshot;
pub mod startup;
pub mod state;
pub mod task_manager;
pub mod upcoming;
pub mod util;

pub use error::{panic_payload, AppError, AppResult};
pub use logging::{init_logging, Telemetry};
