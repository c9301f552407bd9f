//! Fixed-point amount helpers.
//!
//! CRITICAL: Never use floating-point for money calculations.
//! Every debit, credit and quantity is a `rust_decimal::Decimal` persisted as `NUMERIC(19,4)`.

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of decimal places amounts are persisted with.
pub const LEDGER_SCALE: u32 = 4;

/// Rounds an amount to the persisted scale using Banker's Rounding.
///
/// Balance checks run on rounded values so that "balanced" means balanced
/// at the precision the store actually keeps.
#[must_use]
pub fn round_to_scale(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(LEDGER_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Integer-part bound of a `NUMERIC(19,4)` column (15 digits).
const PERSISTED_INTEGER_LIMIT: i64 = 1_000_000_000_000_000;

/// Returns true if the amount, once rounded to the persisted scale, fits a
/// `NUMERIC(19,4)` column.
#[must_use]
pub fn fits_persisted_range(amount: Decimal) -> bool {
    round_to_scale(amount).abs() < Decimal::from(PERSISTED_INTEGER_LIMIT)
}

/// Returns true if the amount carries no fractional part.
#[must_use]
pub fn is_whole(amount: Decimal) -> bool {
    amount.fract().is_zero()
}
