use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// `None` unless `month` is in `1..=12`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Appointment count per day of one month. Days without appointments are
/// absent rather than zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySnapshot {
    month: YearMonth,
    counts: BTreeMap<u32, u32>,
}

impl DaySnapshot {
    pub fn new(month: YearMonth, counts: BTreeMap<u32, u32>) -> Self {
        Self { month, counts }
    }

    pub fn empty(month: YearMonth) -> Self {
        Self::new(month, BTreeMap::new())
    }

    pub fn month(&self) -> YearMonth {
        self.month
    }

    pub fn counts(&self) -> &BTreeMap<u32, u32> {
        &self.counts
    }

    pub fn count_for(&self, day: u32) -> u32 {
        self.counts.get(&day).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().map(|c| u64::from(*c)).sum()
    }
}

/// The two months the poller watches: the one containing "today" and the
/// one after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedState {
    pub current_month: DaySnapshot,
    pub next_month: DaySnapshot,
}

impl WatchedState {
    pub fn differs_from(&self, other: &WatchedState) -> bool {
        has_changed(&self.current_month, &other.current_month)
            || has_changed(&self.next_month, &other.next_month)
    }
}

pub fn has_changed(previous: &DaySnapshot, current: &DaySnapshot) -> bool {
    previous != current
}
