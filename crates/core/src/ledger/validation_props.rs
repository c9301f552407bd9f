//! Property-based tests for line entry validation.

use proptest::prelude::*;
use rust_decimal::Decimal;
use tally_shared::types::{AccountId, DocumentId};

use super::error::LedgerError;
use super::types::{DocumentWithLines, LineEntryInput, build_lines};
use super::validation::validate_lines;

/// Amounts from 0.0001 to 1,000,000.0000.
fn positive_amount() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000_000i64).prop_map(|units| Decimal::new(units, 4))
}

fn debit(amount: Decimal) -> LineEntryInput {
    LineEntryInput::debit(AccountId::new(), amount, "debit")
}

fn credit(amount: Decimal) -> LineEntryInput {
    LineEntryInput::credit(AccountId::new(), amount, "credit")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Splitting one debit across any number of credits always balances,
    /// and the stored lines keep the balance.
    #[test]
    fn prop_split_credits_balance(parts in prop::collection::vec(positive_amount(), 1..10)) {
        let total: Decimal = parts.iter().copied().sum();
        let mut lines = vec![debit(total)];
        lines.extend(parts.into_iter().map(credit));

        let totals = validate_lines(&lines);
        prop_assert!(totals.is_ok(), "expected balanced, got {:?}", totals);

        let stored = DocumentWithLines {
            document: fake_header(),
            lines: build_lines(DocumentId::new(), lines),
        };
        prop_assert!(stored.totals().is_balanced);
    }

    /// Any non-zero difference between the sides is rejected.
    #[test]
    fn prop_unbalanced_rejected(
        amount in positive_amount(),
        delta in positive_amount(),
    ) {
        let lines = vec![debit(amount + delta), credit(amount)];
        let result = validate_lines(&lines);
        prop_assert!(
            matches!(result, Err(LedgerError::UnbalancedEntry { .. })),
            "expected unbalanced, got {:?}",
            result
        );
    }

    /// Negative amounts are rejected whatever the other lines look like.
    #[test]
    fn prop_negative_rejected(amount in positive_amount()) {
        let lines = vec![debit(-amount), credit(-amount)];
        let result = validate_lines(&lines);
        prop_assert!(
            matches!(result, Err(LedgerError::InvalidLine { position: 0, .. })),
            "expected invalid line, got {:?}",
            result
        );
    }
}

fn fake_header() -> super::types::LedgerDocument {
    use chrono::{NaiveDate, Utc};
    use tally_shared::types::{DocumentTypeId, TenantId, UserId};

    let now = Utc::now();
    super::types::LedgerDocument {
        id: DocumentId::new(),
        tenant_id: TenantId::new(),
        doc_type_id: DocumentTypeId::new(),
        sequence_number: 1,
        date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
        due_date: None,
        counterparty_id: None,
        cost_center_id: None,
        warehouse_id: None,
        description: None,
        status: super::types::DocumentStatus::Active,
        created_by: UserId::new(),
        created_at: now,
        updated_at: now,
        voided_at: None,
        voided_by: None,
        void_reason: None,
    }
}
