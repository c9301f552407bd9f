//! Property-based tests for the tiered draw planner.

use proptest::prelude::*;
use uuid::Uuid;

use super::allocation::{Candidate, DrawPlanner};
use super::types::QuotaSource;

fn source_strategy() -> impl Strategy<Value = QuotaSource> {
    prop_oneof![
        Just(QuotaSource::Plan),
        Just(QuotaSource::Overflow),
        Just(QuotaSource::TopUp),
    ]
}

fn candidates_strategy() -> impl Strategy<Value = Vec<Candidate>> {
    prop::collection::vec((source_strategy(), 0i64..1_000), 0..8).prop_map(|items| {
        items
            .into_iter()
            .map(|(source, available)| Candidate {
                source,
                source_id: Uuid::now_v7(),
                available,
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A covered request is drawn exactly, never over any single source.
    #[test]
    fn prop_draws_sum_to_request(
        candidates in candidates_strategy(),
        fraction in 0u32..=100,
    ) {
        let total: i64 = candidates.iter().map(|c| c.available).sum();
        let requested = total * i64::from(fraction) / 100;

        let draws = DrawPlanner::plan(&candidates, requested);
        prop_assert!(draws.is_ok());
        let draws = draws.unwrap_or_default();

        prop_assert_eq!(draws.iter().map(|d| d.amount).sum::<i64>(), requested);
        for draw in &draws {
            prop_assert!(draw.amount > 0);
            prop_assert!(draw.balance_after >= 0);
            prop_assert_eq!(draw.balance_before - draw.amount, draw.balance_after);
        }
    }

    /// Only the last draw may leave its source with units left.
    #[test]
    fn prop_earlier_sources_are_drained_first(
        candidates in candidates_strategy(),
        fraction in 0u32..=100,
    ) {
        let total: i64 = candidates.iter().map(|c| c.available).sum();
        let requested = total * i64::from(fraction) / 100;

        let draws = DrawPlanner::plan(&candidates, requested).unwrap_or_default();
        if let Some((_, earlier)) = draws.split_last() {
            for draw in earlier {
                prop_assert_eq!(draw.balance_after, 0);
            }
        }
    }

    /// An uncovered request produces no draws and reports the exact totals.
    #[test]
    fn prop_shortfall_is_all_or_nothing(
        candidates in candidates_strategy(),
        extra in 1i64..1_000,
    ) {
        let total: i64 = candidates.iter().map(|c| c.available).sum();
        let result = DrawPlanner::plan(&candidates, total + extra);

        match result {
            Ok(draws) => prop_assert!(false, "expected shortfall, got {:?}", draws),
            Err(shortfall) => {
                prop_assert_eq!(shortfall.total(), total);
                prop_assert_eq!(shortfall.requested, total + extra);
            }
        }
    }
}
