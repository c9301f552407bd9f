//! Month close and reopen.
//!
//! Closing a month locks it fiscally and rolls its quota over in one unit:
//! the unused plan balance becomes an overflow pool, every funded top-up of the
//! month expires with its balance captured in the consumption ledger, and a
//! closed-period row is written. Reopening undoes exactly that, reading the
//! captured top-up balances back from the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_shared::types::{ConsumptionEntryId, OverflowPoolId, TenantId, TopUpId, UserId};
use tracing::{info, instrument};
use uuid::Uuid;

use super::types::{
    ConsumptionLedgerEntry, ConsumptionOp, OverflowPool, PlanState, PoolState, QuotaPlanPeriod,
    QuotaSource, TopUpState, overflow_expiry,
};
use crate::fiscal::{ClosedPeriod, YearMonth};
use crate::ledger::LedgerError;
use crate::store::{LedgerTx, PeriodLock};

/// Fields shared by every ledger row one close or reopen writes.
struct Stamp {
    tenant_id: TenantId,
    period: YearMonth,
    actor: Option<UserId>,
    now: DateTime<Utc>,
}

impl Stamp {
    fn entry(
        &self,
        op: ConsumptionOp,
        source: QuotaSource,
        source_id: Uuid,
        amount: i64,
        balance_before: i64,
        balance_after: i64,
    ) -> ConsumptionLedgerEntry {
        ConsumptionLedgerEntry {
            id: ConsumptionEntryId::new(),
            tenant_id: self.tenant_id,
            op,
            source,
            source_id,
            amount,
            balance_before,
            balance_after,
            document_id: None,
            reversal_of: None,
            period: Some(self.period),
            actor: self.actor,
            created_at: self.now,
        }
    }
}

/// What a close did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOutcome {
    /// Month closed.
    pub period: YearMonth,
    /// The month was already closed; nothing was written.
    pub already_closed: bool,
    /// Plan units rolled into the overflow pool.
    pub rolled_over: i64,
    /// Pool created for the rolled-over units.
    pub overflow_pool: Option<OverflowPool>,
    /// Top-ups expired, with the balance captured for each.
    pub expired_top_ups: Vec<(TopUpId, i64)>,
}

/// What a reopen did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReopenOutcome {
    /// Month reopened.
    pub period: YearMonth,
    /// Units credited back to the plan from the month's pools.
    pub restored_to_plan: i64,
    /// Pools voided.
    pub voided_pools: Vec<OverflowPoolId>,
    /// Top-ups reactivated, with their restored balance.
    pub restored_top_ups: Vec<(TopUpId, i64)>,
}

/// Month close/reopen state machine.
pub struct PeriodCloser;

impl PeriodCloser {
    /// Closes a month.
    ///
    /// Idempotent: closing a closed month reports `already_closed` and writes
    /// nothing. A month without a plan gets a zero CLOSED plan.
    ///
    /// # Errors
    ///
    /// Returns `PreviousPeriodOpen` if an earlier operating month is still open,
    /// or a storage error.
    #[instrument(skip_all, fields(%tenant_id, %period))]
    pub async fn close<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        period: YearMonth,
        closed_by: Option<UserId>,
        overflow_lifetime_months: u32,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome, LedgerError> {
        // The previous month's lock keeps a concurrent reopen of it out while
        // the close order is checked.
        let previous = period.previous();
        tx.lock_period(tenant_id, previous, PeriodLock::Exclusive).await?;
        tx.lock_period(tenant_id, period, PeriodLock::Exclusive).await?;
        let existing_plan = tx.lock_plan(tenant_id, period).await?;
        let stamp = Stamp {
            tenant_id,
            period,
            actor: closed_by,
            now,
        };

        if tx.closed_period(tenant_id, period).await?.is_some() {
            return Ok(CloseOutcome {
                period,
                already_closed: true,
                rolled_over: 0,
                overflow_pool: None,
                expired_top_ups: Vec::new(),
            });
        }

        if tx.closed_period(tenant_id, previous).await?.is_none() {
            let first = tx.earliest_plan_period(tenant_id).await?;
            if first.is_some_and(|first| first < period) {
                return Err(LedgerError::PreviousPeriodOpen {
                    year: previous.year,
                    month: previous.month,
                });
            }
        }

        let mut plan = match existing_plan {
            Some(plan) => plan,
            None => {
                let plan = QuotaPlanPeriod::open(tenant_id, period, 0, now);
                tx.insert_plan(&plan).await?;
                plan
            }
        };

        let rolled_over = plan.available.max(0);
        let overflow_pool = if rolled_over > 0 {
            let pool = OverflowPool {
                id: OverflowPoolId::new(),
                tenant_id,
                origin_year: period.year,
                origin_month: period.month,
                initial: rolled_over,
                available: rolled_over,
                expiry_date: overflow_expiry(period, overflow_lifetime_months),
                state: PoolState::Active,
                created_at: now,
            };
            tx.insert_pool(&pool).await?;
            Some(pool)
        } else {
            None
        };

        tx.append_consumption(&stamp.entry(
            ConsumptionOp::Close,
            QuotaSource::Plan,
            plan.id.into_inner(),
            rolled_over,
            plan.available,
            0,
        ))
        .await?;
        plan.available = 0;
        plan.state = PlanState::Closed;
        tx.update_plan(&plan).await?;

        let mut expired_top_ups = Vec::new();
        for mut top_up in tx.lock_top_ups(tenant_id, period).await? {
            if top_up.state != TopUpState::Active || top_up.available <= 0 {
                continue;
            }
            let captured = top_up.available;
            tx.append_consumption(&stamp.entry(
                ConsumptionOp::Expire,
                QuotaSource::TopUp,
                top_up.id.into_inner(),
                captured,
                captured,
                0,
            ))
            .await?;
            top_up.available = 0;
            top_up.state = TopUpState::Expired;
            tx.update_top_up(&top_up).await?;
            expired_top_ups.push((top_up.id, captured));
        }

        tx.insert_closed_period(&ClosedPeriod {
            tenant_id,
            year: period.year,
            month: period.month,
            closed_by,
            closed_at: now,
        })
        .await?;

        info!(
            rolled_over,
            expired_top_ups = expired_top_ups.len(),
            "period closed"
        );
        Ok(CloseOutcome {
            period,
            already_closed: false,
            rolled_over,
            overflow_pool,
            expired_top_ups,
        })
    }

    /// Reopens a closed month.
    ///
    /// Whatever is left in the month's overflow pools goes back to the plan and
    /// the pools are voided; expired top-ups come back with the balance captured
    /// at expiry plus anything reversed into them while dormant. Every REOPEN
    /// entry records `reopened_by`, as CLOSE and EXPIRE entries record `closed_by`.
    ///
    /// # Errors
    ///
    /// Returns `PeriodNotClosed` if the month's plan is not closed,
    /// `FollowingPeriodClosed` if the next month is closed, or a storage error.
    #[instrument(skip_all, fields(%tenant_id, %period))]
    pub async fn reopen<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        period: YearMonth,
        reopened_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<ReopenOutcome, LedgerError> {
        let not_closed = || LedgerError::PeriodNotClosed {
            year: period.year,
            month: period.month,
        };

        let following = period.next();
        tx.lock_period(tenant_id, period, PeriodLock::Exclusive).await?;
        tx.lock_period(tenant_id, following, PeriodLock::Exclusive).await?;
        let mut plan = tx
            .lock_plan(tenant_id, period)
            .await?
            .filter(|p| p.state == PlanState::Closed)
            .ok_or_else(not_closed)?;
        let stamp = Stamp {
            tenant_id,
            period,
            actor: reopened_by,
            now,
        };

        if tx.closed_period(tenant_id, following).await?.is_some() {
            return Err(LedgerError::FollowingPeriodClosed {
                year: following.year,
                month: following.month,
            });
        }

        let mut restored_to_plan = 0;
        let mut voided_pools = Vec::new();
        for mut pool in tx.lock_pools_by_origin(tenant_id, period).await? {
            if pool.state == PoolState::Voided && pool.available == 0 {
                continue;
            }
            let remaining = pool.available;
            if remaining > 0 {
                tx.append_consumption(&stamp.entry(
                    ConsumptionOp::Reopen,
                    QuotaSource::Overflow,
                    pool.id.into_inner(),
                    remaining,
                    remaining,
                    0,
                ))
                .await?;
            }
            pool.available = 0;
            pool.state = PoolState::Voided;
            tx.update_pool(&pool).await?;
            restored_to_plan += remaining;
            voided_pools.push(pool.id);
        }

        tx.append_consumption(&stamp.entry(
            ConsumptionOp::Reopen,
            QuotaSource::Plan,
            plan.id.into_inner(),
            restored_to_plan,
            plan.available,
            plan.available + restored_to_plan,
        ))
        .await?;
        plan.available += restored_to_plan;
        plan.state = PlanState::Open;
        tx.update_plan(&plan).await?;

        let mut restored_top_ups = Vec::new();
        for mut top_up in tx.lock_top_ups(tenant_id, period).await? {
            if top_up.state != TopUpState::Expired {
                continue;
            }
            let captured = tx
                .last_expiry_of(top_up.id)
                .await?
                .map_or(0, |entry| entry.balance_before);
            let dormant = top_up.available;
            let restored = captured + dormant;
            tx.append_consumption(&stamp.entry(
                ConsumptionOp::Reopen,
                QuotaSource::TopUp,
                top_up.id.into_inner(),
                captured,
                dormant,
                restored,
            ))
            .await?;
            top_up.available = restored;
            top_up.state = TopUpState::Active;
            tx.update_top_up(&top_up).await?;
            restored_top_ups.push((top_up.id, restored));
        }

        tx.delete_closed_period(tenant_id, period).await?;

        info!(
            restored_to_plan,
            restored_top_ups = restored_top_ups.len(),
            "period reopened"
        );
        Ok(ReopenOutcome {
            period,
            restored_to_plan,
            voided_pools,
            restored_top_ups,
        })
    }
}
