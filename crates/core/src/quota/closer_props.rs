//! Property tests for month close and reopen.

use chrono::{NaiveDate, Utc};
use proptest::prelude::*;
use tally_shared::types::TenantId;

use super::*;
use crate::fiscal::YearMonth;
use crate::store::{LedgerStore, LedgerTx, MemoryLedgerStore};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Snapshot of everything a close/reopen cycle may touch.
#[derive(Debug, PartialEq, Eq)]
struct MonthState {
    plan: Option<(i64, PlanState)>,
    top_ups: Vec<(i64, TopUpState)>,
    spendable_pools: i64,
}

async fn month_state(store: &MemoryLedgerStore, tenant: TenantId, period: YearMonth) -> MonthState {
    let tables = store.tables().await;
    let plan = tables
        .plans
        .values()
        .find(|p| p.tenant_id == tenant && p.period() == period)
        .map(|p| (p.available, p.state));
    let mut top_ups: Vec<_> = tables
        .top_ups
        .values()
        .filter(|t| t.tenant_id == tenant)
        .map(|t| (t.purchased_at, t.id, t.available, t.state))
        .collect();
    top_ups.sort_by_key(|t| (t.0, t.1));
    let spendable_pools = tables
        .pools
        .values()
        .filter(|p| p.tenant_id == tenant && p.state == PoolState::Active)
        .map(|p| p.available)
        .sum();
    MonthState {
        plan,
        top_ups: top_ups.into_iter().map(|(_, _, a, s)| (a, s)).collect(),
        spendable_pools,
    }
}

proptest! {
    /// With no activity in between, reopen undoes close exactly.
    #[test]
    fn prop_reopen_undoes_close(
        allocated in 0i64..1_000,
        top_ups in prop::collection::vec(1i64..50, 0..4),
        consumed_pct in 0i64..=100,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = MemoryLedgerStore::new();
            let tenant = TenantId::new();
            let period = YearMonth::new(2025, 4).unwrap();
            let today = NaiveDate::from_ymd_opt(2025, 4, 10).unwrap();

            let mut tx = store.begin().await.unwrap();
            ConsumptionMeter::provision_plan(&mut tx, tenant, period, allocated, Utc::now())
                .await
                .unwrap();
            for (i, units) in top_ups.iter().enumerate() {
                let bought = NaiveDate::from_ymd_opt(2025, 4, u32::try_from(i + 1).unwrap())
                    .unwrap()
                    .and_hms_opt(9, 0, 0)
                    .unwrap()
                    .and_utc();
                ConsumptionMeter::purchase_top_up(&mut tx, tenant, period, *units, bought)
                    .await
                    .unwrap();
            }
            let total = allocated + top_ups.iter().sum::<i64>();
            let consumed = total * consumed_pct / 100;
            ConsumptionMeter::consume(&mut tx, tenant, consumed, None, today, Utc::now())
                .await
                .unwrap();
            tx.commit().await.unwrap();

            let before = month_state(&store, tenant, period).await;

            let mut tx = store.begin().await.unwrap();
            let closed = PeriodCloser::close(&mut tx, tenant, period, None, 12, Utc::now())
                .await
                .unwrap();
            PeriodCloser::reopen(&mut tx, tenant, period, None, Utc::now()).await.unwrap();
            tx.commit().await.unwrap();

            let after = month_state(&store, tenant, period).await;
            prop_assert_eq!(closed.rolled_over, allocated - consumed.min(allocated));
            prop_assert_eq!(before, after);
            prop_assert!(store.tables().await.closed_periods.is_empty());
            Ok(())
        })?;
    }

    /// Close conserves units: plan remainder equals the new pool, captured top-ups
    /// equal what was left in them.
    #[test]
    fn prop_close_conserves_units(
        allocated in 0i64..1_000,
        top_up in 0i64..100,
        consumed in 0i64..1_100,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = MemoryLedgerStore::new();
            let tenant = TenantId::new();
            let period = YearMonth::new(2025, 7).unwrap();
            let today = NaiveDate::from_ymd_opt(2025, 7, 3).unwrap();
            let consumed = consumed.min(allocated + top_up);

            let mut tx = store.begin().await.unwrap();
            ConsumptionMeter::provision_plan(&mut tx, tenant, period, allocated, Utc::now())
                .await
                .unwrap();
            if top_up > 0 {
                ConsumptionMeter::purchase_top_up(&mut tx, tenant, period, top_up, Utc::now())
                    .await
                    .unwrap();
            }
            ConsumptionMeter::consume(&mut tx, tenant, consumed, None, today, Utc::now())
                .await
                .unwrap();
            let outcome = PeriodCloser::close(&mut tx, tenant, period, None, 12, Utc::now())
                .await
                .unwrap();
            tx.commit().await.unwrap();

            let pool = outcome.overflow_pool.as_ref().map_or(0, |p| p.initial);
            let captured: i64 = outcome.expired_top_ups.iter().map(|(_, units)| units).sum();
            prop_assert_eq!(pool + captured, allocated + top_up - consumed);
            Ok(())
        })?;
    }
}
