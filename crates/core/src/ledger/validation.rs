//! Business rule validation for document line entries.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tally_shared::types::{fits_persisted_range, round_to_scale};

use super::error::LedgerError;
use super::types::{DocumentTotals, LineEntryInput};

/// Validates a set of line entries and returns their totals.
///
/// Amounts are compared after rounding to the persisted scale, so a document that
/// validates here stays balanced once stored.
///
/// # Errors
///
/// Returns an error if there are fewer than 2 lines, a line is malformed, or the
/// lines do not balance.
pub fn validate_lines(lines: &[LineEntryInput]) -> Result<DocumentTotals, LedgerError> {
    if lines.len() < 2 {
        return Err(LedgerError::InsufficientEntries);
    }

    let mut total_debit = Decimal::ZERO;
    let mut total_credit = Decimal::ZERO;

    for (position, line) in lines.iter().enumerate() {
        let debit = round_to_scale(line.debit);
        let credit = round_to_scale(line.credit);
        validate_line(position, debit, credit, line)?;
        let overflow = || LedgerError::InvalidLine {
            position,
            reason: "document total overflows".to_string(),
        };
        total_debit = total_debit.checked_add(debit).ok_or_else(overflow)?;
        total_credit = total_credit.checked_add(credit).ok_or_else(overflow)?;
    }

    let totals = DocumentTotals::new(total_debit, total_credit);
    if !totals.is_balanced {
        return Err(LedgerError::UnbalancedEntry {
            debit: total_debit,
            credit: total_credit,
        });
    }

    Ok(totals)
}

fn validate_line(
    position: usize,
    debit: Decimal,
    credit: Decimal,
    line: &LineEntryInput,
) -> Result<(), LedgerError> {
    let invalid = |reason: &str| LedgerError::InvalidLine {
        position,
        reason: reason.to_string(),
    };

    if debit < Decimal::ZERO || credit < Decimal::ZERO {
        return Err(invalid("amounts cannot be negative"));
    }
    if !fits_persisted_range(debit) || !fits_persisted_range(credit) {
        return Err(invalid("amount exceeds the storable range"));
    }
    if debit.is_zero() && credit.is_zero() {
        return Err(invalid("line must carry a debit or a credit"));
    }
    if !debit.is_zero() && !credit.is_zero() {
        return Err(invalid("line cannot carry both a debit and a credit"));
    }
    if let Some(quantity) = line.quantity
        && quantity <= Decimal::ZERO
    {
        return Err(invalid("quantity must be positive"));
    }
    if line.quantity.is_some_and(|q| !fits_persisted_range(q))
        || line.unit_cost.is_some_and(|c| !fits_persisted_range(c))
    {
        return Err(invalid("quantity or unit cost exceeds the storable range"));
    }
    if line.quantity.is_some() && line.product_id.is_none() {
        return Err(invalid("quantity given without a product"));
    }
    if let Some(unit_cost) = line.unit_cost
        && unit_cost < Decimal::ZERO
    {
        return Err(invalid("unit cost cannot be negative"));
    }
    Ok(())
}

/// Validates that a due date does not precede the document date.
///
/// # Errors
///
/// Returns `InvalidDueDate` if it does.
pub fn validate_due_date(date: NaiveDate, due_date: Option<NaiveDate>) -> Result<(), LedgerError> {
    match due_date {
        Some(due) if due < date => Err(LedgerError::InvalidDueDate {
            date,
            due_date: due,
        }),
        _ => Ok(()),
    }
}
