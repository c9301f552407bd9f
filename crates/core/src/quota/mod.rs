//! Tiered write quota: monthly plans, overflow pools and top-ups.

pub mod allocation;
pub mod closer;
pub mod meter;
pub mod types;

#[cfg(test)]
mod allocation_props;
#[cfg(test)]
mod closer_props;
#[cfg(test)]
mod tests;

pub use allocation::{Candidate, Draw, DrawPlanner, Shortfall};
pub use closer::{CloseOutcome, PeriodCloser, ReopenOutcome};
pub use meter::ConsumptionMeter;
pub use types::{
    ConsumptionLedgerEntry, ConsumptionOp, OverflowBalance, OverflowPool, PlanState, PoolState,
    QuotaPlanPeriod, QuotaSource, QuotaStatus, QuotaUnits, TopUp, TopUpState, overflow_expiry,
};
