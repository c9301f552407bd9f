//! Tiered draw planning.
//!
//! Splitting a request across ranked quota sources is pure arithmetic, kept apart
//! from the locked reads and writes in [`crate::quota::meter`]. The planner works by:
//! 1. Walking candidates in rank order (plan, pools oldest first, top-ups)
//! 2. Taking `min(remaining, available)` from each
//! 3. Stopping as soon as the request is covered
//!
//! A request larger than the sum of candidates yields no draws at all.

use std::collections::HashSet;

use tally_shared::types::ConsumptionEntryId;
use uuid::Uuid;

use super::types::{ConsumptionLedgerEntry, ConsumptionOp, QuotaSource};

/// One source that can be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Kind of source row.
    pub source: QuotaSource,
    /// Row ID.
    pub source_id: Uuid,
    /// Spendable units.
    pub available: i64,
}

/// Units taken from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    /// Kind of source row.
    pub source: QuotaSource,
    /// Row ID.
    pub source_id: Uuid,
    /// Units taken.
    pub amount: i64,
    /// Source balance before the draw.
    pub balance_before: i64,
    /// Source balance after the draw.
    pub balance_after: i64,
}

/// Totals per tier, reported when a request cannot be covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shortfall {
    /// Units asked for.
    pub requested: i64,
    /// Spendable plan units.
    pub plan: i64,
    /// Spendable overflow units.
    pub overflow: i64,
    /// Spendable top-up units.
    pub top_up: i64,
}

impl Shortfall {
    /// Sum of all tiers, saturating at `i64::MAX`.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.plan
            .saturating_add(self.overflow)
            .saturating_add(self.top_up)
    }
}

/// Draw planner over ranked candidates.
pub struct DrawPlanner;

impl DrawPlanner {
    /// Splits `requested` across `candidates` in the order given.
    ///
    /// Candidates with nothing available are skipped and never produce a draw.
    ///
    /// # Errors
    ///
    /// Returns the per-tier totals if the candidates cannot cover the request.
    pub fn plan(candidates: &[Candidate], requested: i64) -> Result<Vec<Draw>, Shortfall> {
        let shortfall = Self::totals(candidates, requested);
        if shortfall.total() < requested {
            return Err(shortfall);
        }

        let mut remaining = requested;
        let mut draws = Vec::new();
        for candidate in candidates {
            if remaining == 0 {
                break;
            }
            if candidate.available <= 0 {
                continue;
            }
            let amount = remaining.min(candidate.available);
            draws.push(Draw {
                source: candidate.source,
                source_id: candidate.source_id,
                amount,
                balance_before: candidate.available,
                balance_after: candidate.available - amount,
            });
            remaining -= amount;
        }
        Ok(draws)
    }

    /// Per-tier totals of the candidates.
    #[must_use]
    pub fn totals(candidates: &[Candidate], requested: i64) -> Shortfall {
        candidates
            .iter()
            .filter(|c| c.available > 0)
            .fold(
                Shortfall {
                    requested,
                    ..Shortfall::default()
                },
                |mut acc, c| {
                    match c.source {
                        QuotaSource::Plan => acc.plan = acc.plan.saturating_add(c.available),
                        QuotaSource::Overflow => {
                            acc.overflow = acc.overflow.saturating_add(c.available);
                        }
                        QuotaSource::TopUp => acc.top_up = acc.top_up.saturating_add(c.available),
                    }
                    acc
                },
            )
    }

    /// CONSUME entries of `entries` that no REVERSE entry points back to, in order.
    #[must_use]
    pub fn outstanding(entries: &[ConsumptionLedgerEntry]) -> Vec<&ConsumptionLedgerEntry> {
        let reversed: HashSet<ConsumptionEntryId> = entries
            .iter()
            .filter(|e| e.op == ConsumptionOp::Reverse)
            .filter_map(|e| e.reversal_of)
            .collect();
        entries
            .iter()
            .filter(|e| e.op == ConsumptionOp::Consume && !reversed.contains(&e.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_shared::types::{DocumentId, TenantId};

    fn candidate(source: QuotaSource, available: i64) -> Candidate {
        Candidate {
            source,
            source_id: Uuid::now_v7(),
            available,
        }
    }

    #[test]
    fn test_plan_then_pool() {
        let plan = candidate(QuotaSource::Plan, 500);
        let pool = candidate(QuotaSource::Overflow, 300);

        let draws = DrawPlanner::plan(&[plan, pool], 700).unwrap();

        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].source_id, plan.source_id);
        assert_eq!(draws[0].amount, 500);
        assert_eq!(draws[0].balance_after, 0);
        assert_eq!(draws[1].source_id, pool.source_id);
        assert_eq!(draws[1].amount, 200);
        assert_eq!(draws[1].balance_after, 100);
    }

    #[test]
    fn test_stops_when_covered() {
        let draws = DrawPlanner::plan(
            &[
                candidate(QuotaSource::Plan, 10),
                candidate(QuotaSource::TopUp, 10),
            ],
            4,
        )
        .unwrap();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].source, QuotaSource::Plan);
    }

    #[test]
    fn test_skips_empty_sources() {
        let draws = DrawPlanner::plan(
            &[
                candidate(QuotaSource::Plan, 0),
                candidate(QuotaSource::Overflow, 0),
                candidate(QuotaSource::TopUp, 5),
            ],
            5,
        )
        .unwrap();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].source, QuotaSource::TopUp);
    }

    #[test]
    fn test_shortfall_reports_tiers() {
        let err = DrawPlanner::plan(
            &[
                candidate(QuotaSource::Plan, 2),
                candidate(QuotaSource::Overflow, 3),
                candidate(QuotaSource::Overflow, 1),
                candidate(QuotaSource::TopUp, 4),
            ],
            11,
        )
        .unwrap_err();

        assert_eq!(err.requested, 11);
        assert_eq!(err.plan, 2);
        assert_eq!(err.overflow, 4);
        assert_eq!(err.top_up, 4);
        assert_eq!(err.total(), 10);
    }

    #[test]
    fn test_huge_balances_do_not_overflow_totals() {
        let candidates = [
            candidate(QuotaSource::TopUp, i64::MAX),
            candidate(QuotaSource::TopUp, 1),
        ];

        assert_eq!(DrawPlanner::totals(&candidates, 5).total(), i64::MAX);
        let draws = DrawPlanner::plan(&candidates, 5).unwrap();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].balance_after, i64::MAX - 5);
    }

    #[test]
    fn test_zero_request_draws_nothing() {
        let draws = DrawPlanner::plan(&[candidate(QuotaSource::Plan, 5)], 0).unwrap();
        assert!(draws.is_empty());
    }

    #[test]
    fn test_outstanding_skips_reversed() {
        let tenant = TenantId::new();
        let doc = DocumentId::new();
        let entry = |op, reversal_of| ConsumptionLedgerEntry {
            id: ConsumptionEntryId::new(),
            tenant_id: tenant,
            op,
            source: QuotaSource::Plan,
            source_id: Uuid::now_v7(),
            amount: 1,
            balance_before: 1,
            balance_after: 0,
            document_id: Some(doc),
            reversal_of,
            period: None,
            actor: None,
            created_at: Utc::now(),
        };

        let first = entry(ConsumptionOp::Consume, None);
        let second = entry(ConsumptionOp::Consume, None);
        let undo_first = entry(ConsumptionOp::Reverse, Some(first.id));
        let entries = vec![first, second.clone(), undo_first];

        let outstanding = DrawPlanner::outstanding(&entries);
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].id, second.id);
    }
}
