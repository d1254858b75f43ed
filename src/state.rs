use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{AppError, AppResult};

pub const DB_MAINTENANCE_ACTIVE_CODE: &str = "DB_MAINTENANCE_ACTIVE";

/// In-process flag shared by every handle on the same database file. Held
/// while a backup or restore copies the file.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceFlag {
    flag: Arc<AtomicBool>,
}

impl MaintenanceFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> AppResult<MaintenanceGuard> {
        MaintenanceGuard::begin(self.flag.clone())
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with `DB_MAINTENANCE_ACTIVE` while a guard is held.
    pub fn ensure_idle(&self) -> AppResult<()> {
        if self.is_active() {
            return Err(maintenance_active_error());
        }
        Ok(())
    }
}

fn maintenance_active_error() -> AppError {
    AppError::new(
        DB_MAINTENANCE_ACTIVE_CODE,
        "Database maintenance is already running.",
    )
}

pub struct MaintenanceGuard {
    flag: Arc<AtomicBool>,
}

impl MaintenanceGuard {
    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(maintenance_active_error());
        }
        Ok(Self { flag })
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_guard_is_rejected_until_first_drops() {
        let flag = MaintenanceFlag::new();
        let guard = flag.begin().expect("first guard");
        assert!(flag.is_active());
        let err = flag.begin().err().expect("second guard rejected");
        assert_eq!(err.code(), DB_MAINTENANCE_ACTIVE_CODE);
        assert!(flag.ensure_idle().is_err());

        drop(guard);
        assert!(!flag.is_active());
        assert!(flag.ensure_idle().is_ok());
        assert!(flag.begin().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let flag = MaintenanceFlag::new();
        let other = flag.clone();
        let _guard = flag.begin().unwrap();
        assert!(other.is_active());
    }
}
