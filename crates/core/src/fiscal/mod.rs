//! Fiscal months, closed-period rows and the period lock guard.

pub mod guard;
pub mod period;

pub use guard::PeriodGuard;
pub use period::{ClosedPeriod, YearMonth};
