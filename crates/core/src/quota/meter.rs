//! The consumption meter: every quota balance change funnels through here.
//!
//! Writes debit line-entry counts from three ranked tiers: the current month's
//! plan, then unexpired overflow pools oldest origin first, then the current
//! month's top-ups in purchase order. Each source touched produces its own
//! consumption ledger row. Reversals credit the exact row a draw came from.

use chrono::{DateTime, NaiveDate, Utc};
use tally_shared::types::{
    ConsumptionEntryId, DocumentId, OverflowPoolId, QuotaPlanId, TenantId, TopUpId,
};
use tracing::{debug, info, instrument};

use super::allocation::{Candidate, Draw, DrawPlanner};
use super::types::{
    ConsumptionLedgerEntry, ConsumptionOp, OverflowBalance, PlanState, PoolState, QuotaPlanPeriod,
    QuotaSource, QuotaStatus, QuotaUnits, TopUp, TopUpState, saturating_sum,
};
use crate::fiscal::YearMonth;
use crate::ledger::LedgerError;
use crate::store::{LedgerStore, LedgerTx, QuotaSources};

/// Tiered quota engine.
pub struct ConsumptionMeter;

impl ConsumptionMeter {
    /// Spendable units as of `today`, computed from committed state without locks.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn status<S: LedgerStore + ?Sized>(
        store: &S,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<QuotaStatus, LedgerError> {
        let sources = store.quota_sources(tenant_id, today).await?;
        Ok(Self::status_of(tenant_id, today, &sources))
    }

    /// Advisory check that `units` could be consumed right now. Not a reservation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` for negative units, or a storage error.
    pub async fn check_available<S: LedgerStore + ?Sized>(
        store: &S,
        tenant_id: TenantId,
        units: i64,
        today: NaiveDate,
    ) -> Result<bool, LedgerError> {
        let units = QuotaUnits::new(units)?;
        let status = Self::status(store, tenant_id, today).await?;
        Ok(status.total_available() >= units.get())
    }

    /// Builds a status view from already loaded rows.
    #[must_use]
    pub fn status_of(tenant_id: TenantId, today: NaiveDate, sources: &QuotaSources) -> QuotaStatus {
        QuotaStatus {
            tenant_id,
            period: YearMonth::from_date(today),
            plan_available: sources.plan.as_ref().map_or(0, QuotaPlanPeriod::spendable),
            overflow: sources
                .pools
                .iter()
                .filter(|p| p.is_spendable(today))
                .map(|p| OverflowBalance {
                    pool_id: p.id,
                    origin: p.origin(),
                    available: p.available,
                    expiry_date: p.expiry_date,
                })
                .collect(),
            top_up_available: saturating_sum(sources.top_ups.iter().map(TopUp::spendable)),
        }
    }

    /// Debits `units` across the ranked sources under row locks.
    ///
    /// Either the whole amount is drawn or nothing is written.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` for negative units, `InsufficientQuota` with the
    /// current per-tier totals when the sources cannot cover the request, or a
    /// storage error.
    #[instrument(skip_all, fields(%tenant_id, units))]
    pub async fn consume<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        units: i64,
        document_id: Option<DocumentId>,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsumptionLedgerEntry>, LedgerError> {
        let requested = QuotaUnits::new(units)?.get();
        if requested == 0 {
            return Ok(Vec::new());
        }

        let period = YearMonth::from_date(today);
        let mut plan = tx
            .lock_plan(tenant_id, period)
            .await?
            .filter(|p| p.state == PlanState::Open);
        let mut pools = tx.lock_spendable_pools(tenant_id, today).await?;
        let mut top_ups: Vec<TopUp> = tx
            .lock_top_ups(tenant_id, period)
            .await?
            .into_iter()
            .filter(|t| t.state == TopUpState::Active)
            .collect();

        let candidates: Vec<Candidate> = plan
            .iter()
            .map(|p| Candidate {
                source: QuotaSource::Plan,
                source_id: p.id.into_inner(),
                available: p.spendable(),
            })
            .chain(pools.iter().filter(|p| p.is_spendable(today)).map(|p| Candidate {
                source: QuotaSource::Overflow,
                source_id: p.id.into_inner(),
                available: p.available,
            }))
            .chain(top_ups.iter().map(|t| Candidate {
                source: QuotaSource::TopUp,
                source_id: t.id.into_inner(),
                available: t.spendable(),
            }))
            .collect();

        let draws = DrawPlanner::plan(&candidates, requested).map_err(|s| {
            info!(
                requested,
                available = s.total(),
                "quota consumption rejected"
            );
            LedgerError::InsufficientQuota {
                requested,
                plan_available: s.plan,
                overflow_available: s.overflow,
                top_up_available: s.top_up,
                total_available: s.total(),
            }
        })?;

        let mut entries = Vec::with_capacity(draws.len());
        for draw in draws {
            match draw.source {
                QuotaSource::Plan => {
                    if let Some(row) = plan.as_mut() {
                        row.available = draw.balance_after;
                        tx.update_plan(row).await?;
                    }
                }
                QuotaSource::Overflow => {
                    if let Some(pool) = pools.iter_mut().find(|p| p.id.into_inner() == draw.source_id) {
                        pool.available = draw.balance_after;
                        if pool.available == 0 {
                            pool.state = PoolState::Exhausted;
                        }
                        tx.update_pool(pool).await?;
                    }
                }
                QuotaSource::TopUp => {
                    if let Some(top_up) = top_ups
                        .iter_mut()
                        .find(|t| t.id.into_inner() == draw.source_id)
                    {
                        top_up.available = draw.balance_after;
                        tx.update_top_up(top_up).await?;
                    }
                }
            }

            let entry = Self::entry(tenant_id, ConsumptionOp::Consume, &draw, document_id, now);
            tx.append_consumption(&entry).await?;
            entries.push(entry);
        }

        debug!(requested, sources = entries.len(), "quota consumed");
        Ok(entries)
    }

    /// Credits back every unreversed draw tied to a document, each to the row it came from.
    ///
    /// Idempotent: a document with nothing outstanding is a no-op. Dormant rows
    /// (closed plans, voided pools, expired top-ups) take the credit as a balance but
    /// stay dormant; an exhausted pool becomes ACTIVE again.
    ///
    /// # Errors
    ///
    /// Returns `QuotaInvariant` if a source row is gone or would exceed its bound,
    /// or a storage error.
    #[instrument(skip_all, fields(%tenant_id, %document_id))]
    pub async fn reverse<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        document_id: DocumentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsumptionLedgerEntry>, LedgerError> {
        let history = tx.consumption_for_document(document_id).await?;
        let outstanding: Vec<ConsumptionLedgerEntry> = DrawPlanner::outstanding(&history)
            .into_iter()
            .cloned()
            .collect();
        if outstanding.is_empty() {
            return Ok(Vec::new());
        }

        let mut reversals = Vec::with_capacity(outstanding.len());
        for consumed in outstanding {
            let (before, after) = Self::credit_source(tx, &consumed).await?;
            let entry = ConsumptionLedgerEntry {
                id: ConsumptionEntryId::new(),
                tenant_id,
                op: ConsumptionOp::Reverse,
                source: consumed.source,
                source_id: consumed.source_id,
                amount: consumed.amount,
                balance_before: before,
                balance_after: after,
                document_id: Some(document_id),
                reversal_of: Some(consumed.id),
                period: None,
                actor: None,
                created_at: now,
            };
            tx.append_consumption(&entry).await?;
            reversals.push(entry);
        }

        debug!(reversed = reversals.len(), "quota reversed");
        Ok(reversals)
    }

    async fn credit_source<T: LedgerTx>(
        tx: &mut T,
        consumed: &ConsumptionLedgerEntry,
    ) -> Result<(i64, i64), LedgerError> {
        let missing = || {
            LedgerError::QuotaInvariant(format!(
                "{} row {} behind consumption entry {} is gone",
                consumed.source.as_str(),
                consumed.source_id,
                consumed.id
            ))
        };

        match consumed.source {
            QuotaSource::Plan => {
                let mut plan = tx
                    .lock_plan_by_id(QuotaPlanId::from_uuid(consumed.source_id))
                    .await?
                    .ok_or_else(missing)?;
                let before = plan.available;
                plan.available += consumed.amount;
                tx.update_plan(&plan).await?;
                Ok((before, plan.available))
            }
            QuotaSource::Overflow => {
                let mut pool = tx
                    .lock_pool(OverflowPoolId::from_uuid(consumed.source_id))
                    .await?
                    .ok_or_else(missing)?;
                let before = pool.available;
                pool.available += consumed.amount;
                if pool.available > pool.initial {
                    return Err(LedgerError::QuotaInvariant(format!(
                        "overflow pool {} would hold {} of {}",
                        pool.id, pool.available, pool.initial
                    )));
                }
                if pool.state == PoolState::Exhausted {
                    pool.state = PoolState::Active;
                }
                tx.update_pool(&pool).await?;
                Ok((before, pool.available))
            }
            QuotaSource::TopUp => {
                let mut top_up = tx
                    .lock_top_up(TopUpId::from_uuid(consumed.source_id))
                    .await?
                    .ok_or_else(missing)?;
                let before = top_up.available;
                top_up.available += consumed.amount;
                tx.update_top_up(&top_up).await?;
                Ok((before, top_up.available))
            }
        }
    }

    /// Creates or resizes the plan of an OPEN month.
    ///
    /// Resizing moves `available` by the same delta as `allocated`, never below zero.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` for a negative allocation, `PlanNotOpen` for a
    /// closed month, or a storage error.
    #[instrument(skip_all, fields(%tenant_id, %period, allocated))]
    pub async fn provision_plan<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        period: YearMonth,
        allocated: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaPlanPeriod, LedgerError> {
        let allocated = QuotaUnits::new(allocated)?.get();

        let plan = match tx.lock_plan(tenant_id, period).await? {
            None => {
                let plan = QuotaPlanPeriod::open(tenant_id, period, allocated, now);
                tx.insert_plan(&plan).await?;
                plan
            }
            Some(plan) if plan.state == PlanState::Closed => {
                return Err(LedgerError::PlanNotOpen {
                    year: period.year,
                    month: period.month,
                });
            }
            Some(mut plan) => {
                let delta = allocated - plan.allocated;
                plan.allocated = allocated;
                plan.available = (plan.available + delta).max(0);
                tx.update_plan(&plan).await?;
                plan
            }
        };

        info!(available = plan.available, "quota plan provisioned");
        Ok(plan)
    }

    /// Adds a top-up to a month that is not closed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` unless `amount` is positive, `PlanNotOpen` for a
    /// closed month, or a storage error.
    #[instrument(skip_all, fields(%tenant_id, %period, amount))]
    pub async fn purchase_top_up<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        period: YearMonth,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<TopUp, LedgerError> {
        let amount = QuotaUnits::new(amount)?.get();
        if amount == 0 {
            return Err(LedgerError::InvalidQuantity(
                "a top-up must add at least one unit".to_string(),
            ));
        }

        if let Some(plan) = tx.lock_plan(tenant_id, period).await?
            && plan.state == PlanState::Closed
        {
            return Err(LedgerError::PlanNotOpen {
                year: period.year,
                month: period.month,
            });
        }

        let top_up = TopUp {
            id: TopUpId::new(),
            tenant_id,
            year: period.year,
            month: period.month,
            purchased: amount,
            available: amount,
            state: TopUpState::Active,
            purchased_at: now,
        };
        tx.insert_top_up(&top_up).await?;

        info!(top_up_id = %top_up.id, "top-up purchased");
        Ok(top_up)
    }

    fn entry(
        tenant_id: TenantId,
        op: ConsumptionOp,
        draw: &Draw,
        document_id: Option<DocumentId>,
        now: DateTime<Utc>,
    ) -> ConsumptionLedgerEntry {
        ConsumptionLedgerEntry {
            id: ConsumptionEntryId::new(),
            tenant_id,
            op,
            source: draw.source,
            source_id: draw.source_id,
            amount: draw.amount,
            balance_before: draw.balance_before,
            balance_after: draw.balance_after,
            document_id,
            reversal_of: None,
            period: None,
            actor: None,
            created_at: now,
        }
    }
}
