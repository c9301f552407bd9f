//! The closed-period barrier.
//!
//! Every ledger mutation asserts that the month of each affected date is open
//! before writing anything. The check holds the month lock shared until the unit
//! ends, so a close of the month waits for the write or the write sees the close.

use chrono::NaiveDate;
use tally_shared::types::TenantId;

use crate::fiscal::{ClosedPeriod, YearMonth};
use crate::ledger::LedgerError;
use crate::store::{LedgerTx, PeriodLock};

/// Guards writes against closed months.
pub struct PeriodGuard;

impl PeriodGuard {
    /// Fails with `PeriodClosed` if the month containing `date` is closed.
    ///
    /// # Errors
    ///
    /// Returns `PeriodClosed`, or a storage error if the lookup fails.
    pub async fn assert_open<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        date: NaiveDate,
    ) -> Result<(), LedgerError> {
        let period = YearMonth::from_date(date);
        tx.lock_period(tenant_id, period, PeriodLock::Shared).await?;
        let closed = tx.closed_period(tenant_id, period).await?;
        Self::check(closed.as_ref(), tenant_id, date)
    }

    /// Asserts every date is in an open month. Each distinct month is checked
    /// once, earliest first.
    ///
    /// # Errors
    ///
    /// Returns `PeriodClosed` for the first closed month found.
    pub async fn assert_all_open<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        dates: &[NaiveDate],
    ) -> Result<(), LedgerError> {
        let mut ordered = dates.to_vec();
        ordered.sort_unstable();
        ordered.dedup_by_key(|date| YearMonth::from_date(*date));
        for date in ordered {
            Self::assert_open(tx, tenant_id, date).await?;
        }
        Ok(())
    }

    /// Pure check against an already loaded closed-period row.
    ///
    /// # Errors
    ///
    /// Returns `PeriodClosed` if `closed` locks the month of `date`.
    pub fn check(
        closed: Option<&ClosedPeriod>,
        tenant_id: TenantId,
        date: NaiveDate,
    ) -> Result<(), LedgerError> {
        match closed {
            Some(row) if row.tenant_id == tenant_id && row.period().contains(date) => {
                Err(LedgerError::PeriodClosed {
                    tenant_id,
                    year: row.year,
                    month: row.month,
                })
            }
            _ => Ok(()),
        }
    }
}
