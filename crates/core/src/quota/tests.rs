//! Meter and closer behaviour against the in-memory store.

use chrono::{DateTime, NaiveDate, Utc};
use tally_shared::types::{DocumentId, TenantId, UserId};

use super::*;
use crate::fiscal::YearMonth;
use crate::ledger::LedgerError;
use crate::store::{LedgerStore, LedgerTx, MemoryLedgerStore};

fn ym(year: i32, month: u32) -> YearMonth {
    YearMonth::new(year, month).unwrap()
}

fn day(year: i32, month: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, d).unwrap()
}

fn at(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(12, 0, 0).unwrap().and_utc()
}

async fn provision(store: &MemoryLedgerStore, tenant: TenantId, period: YearMonth, units: i64) {
    let mut tx = store.begin().await.unwrap();
    ConsumptionMeter::provision_plan(&mut tx, tenant, period, units, at(period.first_day()))
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

async fn top_up(store: &MemoryLedgerStore, tenant: TenantId, period: YearMonth, units: i64) -> TopUp {
    top_up_on(store, tenant, period, units, period.first_day()).await
}

async fn top_up_on(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    period: YearMonth,
    units: i64,
    bought: NaiveDate,
) -> TopUp {
    let mut tx = store.begin().await.unwrap();
    let top_up = ConsumptionMeter::purchase_top_up(&mut tx, tenant, period, units, at(bought))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    top_up
}

async fn close(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    period: YearMonth,
) -> Result<CloseOutcome, LedgerError> {
    close_by(store, tenant, period, None).await
}

async fn close_by(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    period: YearMonth,
    actor: Option<UserId>,
) -> Result<CloseOutcome, LedgerError> {
    let mut tx = store.begin().await?;
    let outcome =
        PeriodCloser::close(&mut tx, tenant, period, actor, 12, at(period.last_day())).await?;
    tx.commit().await?;
    Ok(outcome)
}

async fn reopen(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    period: YearMonth,
) -> Result<ReopenOutcome, LedgerError> {
    reopen_by(store, tenant, period, None).await
}

async fn reopen_by(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    period: YearMonth,
    actor: Option<UserId>,
) -> Result<ReopenOutcome, LedgerError> {
    let mut tx = store.begin().await?;
    let outcome =
        PeriodCloser::reopen(&mut tx, tenant, period, actor, at(period.last_day())).await?;
    tx.commit().await?;
    Ok(outcome)
}

async fn consume(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    units: i64,
    document_id: Option<DocumentId>,
    today: NaiveDate,
) -> Result<Vec<ConsumptionLedgerEntry>, LedgerError> {
    let mut tx = store.begin().await?;
    let entries =
        ConsumptionMeter::consume(&mut tx, tenant, units, document_id, today, at(today)).await?;
    tx.commit().await?;
    Ok(entries)
}

async fn reverse(
    store: &MemoryLedgerStore,
    tenant: TenantId,
    document_id: DocumentId,
) -> Vec<ConsumptionLedgerEntry> {
    let mut tx = store.begin().await.unwrap();
    let entries = ConsumptionMeter::reverse(&mut tx, tenant, document_id, Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    entries
}

// ============================================================================
// Consumption
// ============================================================================

#[tokio::test]
async fn test_consume_from_plan_only() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 100).await;

    let entries = consume(&store, tenant, 30, None, day(2025, 1, 10)).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, QuotaSource::Plan);
    assert_eq!(entries[0].balance_before, 100);
    assert_eq!(entries[0].balance_after, 70);

    let status = ConsumptionMeter::status(&store, tenant, day(2025, 1, 10)).await.unwrap();
    assert_eq!(status.plan_available, 70);
    assert_eq!(status.total_available(), 70);
}

#[tokio::test]
async fn test_consume_spills_from_plan_into_overflow() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 300).await;
    close(&store, tenant, ym(2025, 1)).await.unwrap();
    provision(&store, tenant, ym(2025, 2), 500).await;

    let entries = consume(&store, tenant, 700, None, day(2025, 2, 10)).await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].source, QuotaSource::Plan);
    assert_eq!(entries[0].amount, 500);
    assert_eq!(entries[1].source, QuotaSource::Overflow);
    assert_eq!(entries[1].amount, 200);
    assert_eq!(entries[1].balance_after, 100);

    let status = ConsumptionMeter::status(&store, tenant, day(2025, 2, 10)).await.unwrap();
    assert_eq!(status.plan_available, 0);
    assert_eq!(status.overflow_available(), 100);
}

#[tokio::test]
async fn test_consume_falls_through_to_top_ups() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 3), 5).await;
    let first = top_up_on(&store, tenant, ym(2025, 3), 4, day(2025, 3, 1)).await;
    let second = top_up_on(&store, tenant, ym(2025, 3), 10, day(2025, 3, 2)).await;

    let entries = consume(&store, tenant, 12, None, day(2025, 3, 2)).await.unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1].source_id, first.id.into_inner());
    assert_eq!(entries[1].amount, 4);
    assert_eq!(entries[2].source_id, second.id.into_inner());
    assert_eq!(entries[2].amount, 3);
}

#[tokio::test]
async fn test_insufficient_quota_writes_nothing() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 10).await;
    top_up(&store, tenant, ym(2025, 1), 5).await;

    let err = consume(&store, tenant, 16, None, day(2025, 1, 20)).await.unwrap_err();

    match err {
        LedgerError::InsufficientQuota {
            requested,
            plan_available,
            overflow_available,
            top_up_available,
            total_available,
        } => {
            assert_eq!(requested, 16);
            assert_eq!(plan_available, 10);
            assert_eq!(overflow_available, 0);
            assert_eq!(top_up_available, 5);
            assert_eq!(total_available, 15);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let tables = store.tables().await;
    assert!(tables.consumption.is_empty());
    assert!(tables.plans.values().all(|p| p.available == 10));
}

#[tokio::test]
async fn test_zero_units_is_a_no_op() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();

    let entries = consume(&store, tenant, 0, None, day(2025, 1, 1)).await.unwrap();

    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_negative_units_rejected() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();

    let err = consume(&store, tenant, -1, None, day(2025, 1, 1)).await.unwrap_err();

    assert!(matches!(err, LedgerError::InvalidQuantity(_)));
}

#[tokio::test]
async fn test_expired_pool_is_not_spendable() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 50).await;
    let outcome = close(&store, tenant, ym(2025, 1)).await.unwrap();
    let pool = outcome.overflow_pool.unwrap();
    assert_eq!(pool.expiry_date, day(2026, 1, 31));

    let on_expiry = ConsumptionMeter::status(&store, tenant, day(2026, 1, 31)).await.unwrap();
    assert_eq!(on_expiry.overflow_available(), 50);

    let after = ConsumptionMeter::status(&store, tenant, day(2026, 2, 1)).await.unwrap();
    assert_eq!(after.overflow_available(), 0);
    assert!(
        !ConsumptionMeter::check_available(&store, tenant, 1, day(2026, 2, 1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_check_available_is_advisory() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 3).await;

    let today = day(2025, 1, 5);
    assert!(ConsumptionMeter::check_available(&store, tenant, 3, today).await.unwrap());
    assert!(!ConsumptionMeter::check_available(&store, tenant, 4, today).await.unwrap());
    assert!(store.tables().await.consumption.is_empty());
}

#[tokio::test]
async fn test_oversized_quota_amounts_rejected() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    let period = ym(2025, 1);

    let mut tx = store.begin().await.unwrap();
    let err = ConsumptionMeter::purchase_top_up(&mut tx, tenant, period, i64::MAX, at(day(2025, 1, 2)))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidQuantity(_)));
    let err = ConsumptionMeter::provision_plan(&mut tx, tenant, period, i64::MAX, at(day(2025, 1, 2)))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidQuantity(_)));
    drop(tx);

    let max = QuotaUnits::MAX.get();
    top_up(&store, tenant, period, max).await;
    top_up(&store, tenant, period, 1).await;

    let today = day(2025, 1, 5);
    let status = ConsumptionMeter::status(&store, tenant, today).await.unwrap();
    assert_eq!(status.total_available(), max + 1);
    assert!(ConsumptionMeter::check_available(&store, tenant, max, today).await.unwrap());
    assert!(ConsumptionMeter::check_available(&store, tenant, i64::MAX, today).await.is_err());
}

// ============================================================================
// Reversal
// ============================================================================

#[tokio::test]
async fn test_reverse_credits_the_exact_rows() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 20).await;
    close(&store, tenant, ym(2025, 1)).await.unwrap();
    provision(&store, tenant, ym(2025, 2), 5).await;
    let document = DocumentId::new();

    let consumed = consume(&store, tenant, 25, Some(document), day(2025, 2, 3)).await.unwrap();
    let pool_id = consumed[1].source_id;
    {
        let tables = store.tables().await;
        let pool = tables.pools.values().find(|p| p.id.into_inner() == pool_id).unwrap();
        assert_eq!(pool.state, PoolState::Exhausted);
    }

    let reversed = reverse(&store, tenant, document).await;

    assert_eq!(reversed.len(), 2);
    for (reversal, original) in reversed.iter().zip(&consumed) {
        assert_eq!(reversal.op, ConsumptionOp::Reverse);
        assert_eq!(reversal.source_id, original.source_id);
        assert_eq!(reversal.amount, original.amount);
        assert_eq!(reversal.reversal_of, Some(original.id));
    }

    let tables = store.tables().await;
    let pool = tables.pools.values().find(|p| p.id.into_inner() == pool_id).unwrap();
    assert_eq!(pool.state, PoolState::Active);
    assert_eq!(pool.available, 20);
}

#[tokio::test]
async fn test_second_reverse_is_a_no_op() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 20).await;
    let document = DocumentId::new();
    consume(&store, tenant, 4, Some(document), day(2025, 1, 3)).await.unwrap();

    assert_eq!(reverse(&store, tenant, document).await.len(), 1);
    assert!(reverse(&store, tenant, document).await.is_empty());

    let status = ConsumptionMeter::status(&store, tenant, day(2025, 1, 3)).await.unwrap();
    assert_eq!(status.plan_available, 20);
}

#[tokio::test]
async fn test_reverse_into_closed_plan_stays_dormant_until_reopen() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 10).await;
    let document = DocumentId::new();
    consume(&store, tenant, 4, Some(document), day(2025, 1, 15)).await.unwrap();
    close(&store, tenant, ym(2025, 1)).await.unwrap();

    reverse(&store, tenant, document).await;

    let february = ConsumptionMeter::status(&store, tenant, day(2025, 2, 1)).await.unwrap();
    assert_eq!(february.plan_available, 0);
    assert_eq!(february.overflow_available(), 6);

    let outcome = reopen(&store, tenant, ym(2025, 1)).await.unwrap();
    assert_eq!(outcome.restored_to_plan, 6);

    let january = ConsumptionMeter::status(&store, tenant, day(2025, 1, 20)).await.unwrap();
    assert_eq!(january.plan_available, 10);
}

// ============================================================================
// Plans and top-ups
// ============================================================================

#[tokio::test]
async fn test_resizing_plan_moves_available_by_delta() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 100).await;
    consume(&store, tenant, 70, None, day(2025, 1, 2)).await.unwrap();

    provision(&store, tenant, ym(2025, 1), 150).await;
    let grown = ConsumptionMeter::status(&store, tenant, day(2025, 1, 2)).await.unwrap();
    assert_eq!(grown.plan_available, 80);

    provision(&store, tenant, ym(2025, 1), 10).await;
    let shrunk = ConsumptionMeter::status(&store, tenant, day(2025, 1, 2)).await.unwrap();
    assert_eq!(shrunk.plan_available, 0);
}

#[tokio::test]
async fn test_closed_month_rejects_plan_and_top_up_changes() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 10).await;
    close(&store, tenant, ym(2025, 1)).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let plan_err = ConsumptionMeter::provision_plan(&mut tx, tenant, ym(2025, 1), 20, Utc::now())
        .await
        .unwrap_err();
    let top_up_err = ConsumptionMeter::purchase_top_up(&mut tx, tenant, ym(2025, 1), 5, Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(plan_err, LedgerError::PlanNotOpen { year: 2025, month: 1 }));
    assert!(matches!(top_up_err, LedgerError::PlanNotOpen { year: 2025, month: 1 }));
}

#[tokio::test]
async fn test_empty_top_up_rejected() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();

    let mut tx = store.begin().await.unwrap();
    let err = ConsumptionMeter::purchase_top_up(&mut tx, tenant, ym(2025, 1), 0, Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidQuantity(_)));
}

// ============================================================================
// Close and reopen
// ============================================================================

#[tokio::test]
async fn test_close_rolls_plan_into_pool() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 500).await;

    let outcome = close(&store, tenant, ym(2025, 1)).await.unwrap();

    assert!(!outcome.already_closed);
    assert_eq!(outcome.rolled_over, 500);
    let pool = outcome.overflow_pool.unwrap();
    assert_eq!(pool.initial, 500);
    assert_eq!(pool.available, 500);
    assert_eq!(pool.expiry_date, day(2026, 1, 31));

    let tables = store.tables().await;
    let plan = tables.plans.values().next().unwrap();
    assert_eq!(plan.state, PlanState::Closed);
    assert_eq!(plan.available, 0);
    assert!(tables.closed_periods.contains_key(&(tenant, ym(2025, 1))));
    let close_entry = tables
        .consumption
        .iter()
        .find(|e| e.op == ConsumptionOp::Close)
        .unwrap();
    assert_eq!(close_entry.amount, 500);
    assert_eq!(close_entry.period, Some(ym(2025, 1)));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 8).await;
    close(&store, tenant, ym(2025, 1)).await.unwrap();
    let entries_after_first = store.tables().await.consumption.len();

    let second = close(&store, tenant, ym(2025, 1)).await.unwrap();

    assert!(second.already_closed);
    assert!(second.overflow_pool.is_none());
    let tables = store.tables().await;
    assert_eq!(tables.consumption.len(), entries_after_first);
    assert_eq!(tables.pools.len(), 1);
}

#[tokio::test]
async fn test_close_without_plan_writes_zero_plan() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();

    let outcome = close(&store, tenant, ym(2025, 6)).await.unwrap();

    assert_eq!(outcome.rolled_over, 0);
    assert!(outcome.overflow_pool.is_none());
    let tables = store.tables().await;
    let plan = tables.plans.values().next().unwrap();
    assert_eq!(plan.allocated, 0);
    assert_eq!(plan.state, PlanState::Closed);
    assert!(tables.pools.is_empty());
    assert_eq!(tables.consumption.len(), 1);
    assert_eq!(tables.consumption[0].amount, 0);
}

#[tokio::test]
async fn test_close_requires_previous_month_closed() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 10).await;
    provision(&store, tenant, ym(2025, 2), 10).await;

    let err = close(&store, tenant, ym(2025, 2)).await.unwrap_err();

    assert!(matches!(err, LedgerError::PreviousPeriodOpen { year: 2025, month: 1 }));
    assert!(store.tables().await.closed_periods.is_empty());
}

#[tokio::test]
async fn test_close_expires_funded_top_ups() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 0).await;
    let funded = top_up(&store, tenant, ym(2025, 1), 9).await;
    consume(&store, tenant, 2, None, day(2025, 1, 4)).await.unwrap();

    let outcome = close(&store, tenant, ym(2025, 1)).await.unwrap();

    assert_eq!(outcome.expired_top_ups, vec![(funded.id, 7)]);
    let tables = store.tables().await;
    let row = &tables.top_ups[&funded.id];
    assert_eq!(row.state, TopUpState::Expired);
    assert_eq!(row.available, 0);
    let expire = tables
        .consumption
        .iter()
        .find(|e| e.op == ConsumptionOp::Expire)
        .unwrap();
    assert_eq!(expire.balance_before, 7);
}

#[tokio::test]
async fn test_drained_top_up_stays_active_at_close() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 0).await;
    let drained = top_up(&store, tenant, ym(2025, 1), 3).await;
    consume(&store, tenant, 3, None, day(2025, 1, 4)).await.unwrap();

    let outcome = close(&store, tenant, ym(2025, 1)).await.unwrap();

    assert!(outcome.expired_top_ups.is_empty());
    assert_eq!(
        store.tables().await.top_ups[&drained.id].state,
        TopUpState::Active
    );
}

#[tokio::test]
async fn test_reopen_restores_plan_and_top_ups() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    let closed_by = UserId::new();
    let reopened_by = UserId::new();
    provision(&store, tenant, ym(2025, 1), 40).await;
    let bought = top_up(&store, tenant, ym(2025, 1), 6).await;
    consume(&store, tenant, 15, None, day(2025, 1, 9)).await.unwrap();
    close_by(&store, tenant, ym(2025, 1), Some(closed_by)).await.unwrap();
    // Part of the pool is spent in February before the reopen.
    provision(&store, tenant, ym(2025, 2), 0).await;
    consume(&store, tenant, 5, None, day(2025, 2, 2)).await.unwrap();

    let outcome = reopen_by(&store, tenant, ym(2025, 1), Some(reopened_by)).await.unwrap();

    assert_eq!(outcome.restored_to_plan, 20);
    assert_eq!(outcome.voided_pools.len(), 1);
    assert_eq!(outcome.restored_top_ups, vec![(bought.id, 6)]);

    let tables = store.tables().await;
    assert!(tables.closed_periods.is_empty());
    let january = tables
        .plans
        .values()
        .find(|p| p.period() == ym(2025, 1))
        .unwrap();
    assert_eq!(january.state, PlanState::Open);
    assert_eq!(january.available, 20);
    assert!(tables.pools.values().all(|p| p.state == PoolState::Voided && p.available == 0));
    assert_eq!(tables.top_ups[&bought.id].state, TopUpState::Active);

    // Both actors stay on the trail after the closed-period row is gone.
    let actors_of = |op: ConsumptionOp| -> Vec<Option<UserId>> {
        tables
            .consumption
            .iter()
            .filter(|e| e.op == op)
            .map(|e| e.actor)
            .collect()
    };
    assert_eq!(actors_of(ConsumptionOp::Close), vec![Some(closed_by)]);
    assert_eq!(actors_of(ConsumptionOp::Expire), vec![Some(closed_by)]);
    let reopens = actors_of(ConsumptionOp::Reopen);
    assert_eq!(reopens.len(), 3);
    assert!(reopens.iter().all(|actor| *actor == Some(reopened_by)));
    assert!(actors_of(ConsumptionOp::Consume).iter().all(Option::is_none));
}

#[tokio::test]
async fn test_reopen_open_month_rejected() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 10).await;

    let err = reopen(&store, tenant, ym(2025, 1)).await.unwrap_err();

    assert!(matches!(err, LedgerError::PeriodNotClosed { year: 2025, month: 1 }));
}

#[tokio::test]
async fn test_reopen_blocked_by_closed_following_month() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 10).await;
    close(&store, tenant, ym(2025, 1)).await.unwrap();
    close(&store, tenant, ym(2025, 2)).await.unwrap();

    let err = reopen(&store, tenant, ym(2025, 1)).await.unwrap_err();

    assert!(matches!(
        err,
        LedgerError::FollowingPeriodClosed { year: 2025, month: 2 }
    ));
}

#[tokio::test]
async fn test_close_reopen_close_again() {
    let store = MemoryLedgerStore::new();
    let tenant = TenantId::new();
    provision(&store, tenant, ym(2025, 1), 12).await;
    close(&store, tenant, ym(2025, 1)).await.unwrap();
    reopen(&store, tenant, ym(2025, 1)).await.unwrap();

    let again = close(&store, tenant, ym(2025, 1)).await.unwrap();

    assert!(!again.already_closed);
    assert_eq!(again.rolled_over, 12);
    let status = ConsumptionMeter::status(&store, tenant, day(2025, 2, 1)).await.unwrap();
    assert_eq!(status.overflow_available(), 12);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let store = MemoryLedgerStore::new();
    let a = TenantId::new();
    let b = TenantId::new();
    provision(&store, a, ym(2025, 1), 10).await;

    let err = consume(&store, b, 1, None, day(2025, 1, 2)).await.unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientQuota { total_available: 0, .. }));
    let status = ConsumptionMeter::status(&store, a, day(2025, 1, 2)).await.unwrap();
    assert_eq!(status.plan_available, 10);
}
