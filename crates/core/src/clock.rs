//! Time source for the ledger.
//!
//! "Today" decides which month's plan and top-ups are drawn and which overflow
//! pools have expired, so it is injected rather than read from the system.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Current calendar date (UTC).
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    /// A clock stopped at `at`.
    #[must_use]
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at: Arc::new(RwLock::new(at)),
        }
    }

    /// A clock stopped at noon UTC of `date`.
    #[must_use]
    pub fn on(date: NaiveDate) -> Self {
        Self::at(Self::noon(date))
    }

    /// Moves the clock to noon UTC of `date`.
    pub fn set_date(&self, date: NaiveDate) {
        if let Ok(mut at) = self.at.write() {
            *at = Self::noon(date);
        }
    }

    fn noon(date: NaiveDate) -> DateTime<Utc> {
        date.and_hms_opt(12, 0, 0)
            .unwrap_or_default()
            .and_utc()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at.read().map_or_else(|poisoned| *poisoned.into_inner(), |at| *at)
    }
}
