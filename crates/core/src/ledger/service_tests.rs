//! Document lifecycle tests against the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tally_shared::LedgerConfig;
use tally_shared::types::{
    AccountId, CounterpartyId, DocumentId, DocumentTypeId, ProductId, TenantId, UserId,
};

use super::*;
use crate::clock::FixedClock;
use crate::collaborators::{
    CollaboratorError, CounterpartyBalances, InventoryMovement, InventoryPort,
};
use crate::quota::{ConsumptionOp, PlanState};
use crate::recalc::RecalculationDispatcher;
use crate::store::MemoryLedgerStore;

// ============================================================================
// Collaborator doubles
// ============================================================================

#[derive(Default)]
struct RecordingInventory {
    posted: Mutex<Vec<InventoryMovement>>,
    reversed: Mutex<Vec<DocumentId>>,
    recomputed: Mutex<Vec<ProductId>>,
    fail_posts: AtomicBool,
}

#[async_trait]
impl InventoryPort for RecordingInventory {
    async fn post_movement(&self, movement: &InventoryMovement) -> Result<(), CollaboratorError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("inventory", "warehouse offline"));
        }
        self.posted.lock().unwrap().push(movement.clone());
        Ok(())
    }

    async fn reverse_movements_of(&self, document_id: DocumentId) -> Result<(), CollaboratorError> {
        self.reversed.lock().unwrap().push(document_id);
        Ok(())
    }

    async fn recompute_balances(&self, product_ids: &[ProductId]) -> Result<(), CollaboratorError> {
        self.recomputed.lock().unwrap().extend_from_slice(product_ids);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBalances {
    calls: Mutex<Vec<CounterpartyId>>,
}

#[async_trait]
impl CounterpartyBalances for RecordingBalances {
    async fn recalculate_for_counterparty(
        &self,
        counterparty_id: CounterpartyId,
        _tenant_id: TenantId,
    ) -> Result<(), CollaboratorError> {
        self.calls.lock().unwrap().push(counterparty_id);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    service: DocumentLedgerService<MemoryLedgerStore>,
    clock: FixedClock,
    inventory: Arc<RecordingInventory>,
    balances: Arc<RecordingBalances>,
    tenant: TenantId,
    doc_type: DocumentTypeId,
    user: UserId,
}

fn day(year: i32, month: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, d).unwrap()
}

/// A service on 2025-01-15 with `plan` units provisioned for January.
async fn harness(plan: i64) -> Harness {
    let clock = FixedClock::on(day(2025, 1, 15));
    let inventory = Arc::new(RecordingInventory::default());
    let balances = Arc::new(RecordingBalances::default());
    let service = DocumentLedgerService::new(MemoryLedgerStore::new(), LedgerConfig::default())
        .with_clock(Arc::new(clock.clone()))
        .with_inventory(inventory.clone())
        .with_recalculation(RecalculationDispatcher::inline(balances.clone(), 3));
    let tenant = TenantId::new();
    service.provision_plan(tenant, 2025, 1, plan).await.unwrap();

    Harness {
        service,
        clock,
        inventory,
        balances,
        tenant,
        doc_type: DocumentTypeId::new(),
        user: UserId::new(),
    }
}

/// `count` balanced lines: `count - 1` debits of 100 and one closing credit.
fn balanced(count: usize) -> Vec<LineEntryInput> {
    let debits = count - 1;
    let mut lines: Vec<LineEntryInput> = (0..debits)
        .map(|_| LineEntryInput::debit(AccountId::new(), dec!(100), "debit"))
        .collect();
    lines.push(LineEntryInput::credit(
        AccountId::new(),
        Decimal::from(debits) * dec!(100),
        "credit",
    ));
    lines
}

impl Harness {
    fn input(&self, date: NaiveDate, lines: Vec<LineEntryInput>) -> CreateDocumentInput {
        CreateDocumentInput {
            tenant_id: self.tenant,
            doc_type_id: self.doc_type,
            date,
            due_date: None,
            counterparty_id: None,
            cost_center_id: None,
            warehouse_id: None,
            description: Some("test".to_string()),
            number: None,
            lines,
            created_by: self.user,
        }
    }

    async fn create(&self, lines: usize) -> DocumentWithLines {
        self.service
            .create_document(self.input(day(2025, 1, 10), balanced(lines)))
            .await
            .unwrap()
    }

    async fn configure(&self, settings: DocumentTypeSettings) {
        self.service
            .configure_document_type(self.tenant, self.doc_type, settings)
            .await
            .unwrap();
    }

    async fn plan_available(&self) -> i64 {
        self.service.quota_status(self.tenant).await.unwrap().plan_available
    }

    fn update_input(&self, document_id: DocumentId, lines: Vec<LineEntryInput>) -> UpdateDocumentInput {
        UpdateDocumentInput {
            tenant_id: self.tenant,
            document_id,
            date: day(2025, 1, 12),
            due_date: None,
            counterparty_id: None,
            cost_center_id: None,
            lines,
            actor: self.user,
        }
    }
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_allocates_increasing_numbers_and_consumes_lines() {
    let h = harness(100).await;

    let first = h.create(2).await;
    let second = h.create(3).await;
    let third = h.create(2).await;

    assert_eq!(first.document.sequence_number, 1);
    assert_eq!(second.document.sequence_number, 2);
    assert_eq!(third.document.sequence_number, 3);
    assert_eq!(first.document.status, DocumentStatus::Active);
    assert_eq!(h.plan_available().await, 93);

    let tables = h.service.store().tables().await;
    assert_eq!(tables.documents.len(), 3);
    assert_eq!(tables.lines[&second.document.id].len(), 3);
}

#[tokio::test]
async fn test_create_in_closed_period_leaves_no_trace() {
    let h = harness(100).await;
    h.service.close_period(h.tenant, 2024, 12, None).await.unwrap();
    let before = h.service.store().tables().await;

    let err = h
        .service
        .create_document(h.input(day(2024, 12, 20), balanced(2)))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::PeriodClosed { year: 2024, month: 12, .. }));
    let after = h.service.store().tables().await;
    assert!(after.documents.is_empty());
    assert_eq!(after.consumption.len(), before.consumption.len());
    assert!(after.sequences.is_empty());
}

#[tokio::test]
async fn test_failed_create_does_not_consume_a_number() {
    let h = harness(100).await;
    let mut unbalanced = balanced(2);
    unbalanced[0].debit = dec!(99);

    let err = h
        .service
        .create_document(h.input(day(2025, 1, 10), unbalanced))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnbalancedEntry { .. }));

    let created = h.create(2).await;
    assert_eq!(created.document.sequence_number, 1);
}

#[tokio::test]
async fn test_insufficient_quota_rolls_back_numbering() {
    let h = harness(3).await;
    h.create(2).await;

    let err = h
        .service
        .create_document(h.input(day(2025, 1, 10), balanced(2)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InsufficientQuota { requested: 2, total_available: 1, .. }
    ));
    let tables = h.service.store().tables().await;
    assert_eq!(tables.documents.len(), 1);
    assert_eq!(tables.sequences[&(h.tenant, h.doc_type)].current_number, 1);
}

#[tokio::test]
async fn test_due_date_before_document_date_rejected() {
    let h = harness(10).await;
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.due_date = Some(day(2025, 1, 9));

    let err = h.service.create_document(input).await.unwrap_err();

    assert!(matches!(err, LedgerError::InvalidDueDate { .. }));
}

#[tokio::test]
async fn test_manual_numbering() {
    let h = harness(10).await;
    h.configure(DocumentTypeSettings {
        manual_numbering: true,
        ..DocumentTypeSettings::default()
    })
    .await;

    let missing = h
        .service
        .create_document(h.input(day(2025, 1, 10), balanced(2)))
        .await
        .unwrap_err();
    assert!(matches!(missing, LedgerError::ManualNumberRequired(_)));

    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.number = Some(40);
    let created = h.service.create_document(input.clone()).await.unwrap();
    assert_eq!(created.document.sequence_number, 40);

    let duplicate = h.service.create_document(input).await.unwrap_err();
    assert!(matches!(duplicate, LedgerError::SequenceConflict { number: 40, .. }));
    assert!(duplicate.is_retryable());
}

#[tokio::test]
async fn test_auto_numbering_rejects_supplied_number() {
    let h = harness(10).await;
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.number = Some(7);

    let err = h.service.create_document(input).await.unwrap_err();

    assert!(matches!(err, LedgerError::ManualNumberNotAllowed(_)));
}

// ============================================================================
// Void and reactivate
// ============================================================================

#[tokio::test]
async fn test_void_returns_quota_and_keeps_document() {
    let h = harness(10).await;
    let created = h.create(4).await;
    assert_eq!(h.plan_available().await, 6);

    let voided = h
        .service
        .void_document(h.tenant, created.document.id, "duplicate".to_string(), h.user)
        .await
        .unwrap();

    assert_eq!(voided.status, DocumentStatus::Voided);
    assert_eq!(voided.void_reason.as_deref(), Some("duplicate"));
    assert_eq!(voided.voided_by, Some(h.user));
    assert_eq!(h.plan_available().await, 10);

    let tables = h.service.store().tables().await;
    assert_eq!(tables.operation_logs.len(), 1);
    assert_eq!(tables.operation_logs[0].kind, OperationKind::Void);
    assert_eq!(tables.lines[&created.document.id].len(), 4);
}

#[tokio::test]
async fn test_void_twice_rejected() {
    let h = harness(10).await;
    let created = h.create(2).await;
    h.service
        .void_document(h.tenant, created.document.id, "x".to_string(), h.user)
        .await
        .unwrap();

    let err = h
        .service
        .void_document(h.tenant, created.document.id, "x".to_string(), h.user)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InvalidDocumentState {
            expected: DocumentStatus::Active,
            actual: DocumentStatus::Voided,
            ..
        }
    ));
}

#[tokio::test]
async fn test_reactivate_restores_the_original_document() {
    let h = harness(10).await;
    let created = h.create(3).await;
    h.service
        .void_document(h.tenant, created.document.id, "oops".to_string(), h.user)
        .await
        .unwrap();

    let reactivated = h
        .service
        .reactivate_document(h.tenant, created.document.id, h.user)
        .await
        .unwrap();

    assert_eq!(reactivated.status, DocumentStatus::Active);
    assert_eq!(reactivated.sequence_number, created.document.sequence_number);
    assert!(reactivated.voided_at.is_none());
    assert!(reactivated.void_reason.is_none());
    assert_eq!(h.plan_available().await, 7);

    let stored = h.service.get_document(h.tenant, created.document.id).await.unwrap();
    assert_eq!(stored.lines, created.lines);
}

#[tokio::test]
async fn test_reactivate_collides_with_reused_number() {
    let h = harness(10).await;
    h.configure(DocumentTypeSettings {
        manual_numbering: true,
        ..DocumentTypeSettings::default()
    })
    .await;
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.number = Some(5);
    let original = h.service.create_document(input.clone()).await.unwrap();
    h.service
        .void_document(h.tenant, original.document.id, "replaced".to_string(), h.user)
        .await
        .unwrap();
    h.service.create_document(input).await.unwrap();

    let err = h
        .service
        .reactivate_document(h.tenant, original.document.id, h.user)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::SequenceConflict { number: 5, .. }));
    let stored = h.service.get_document(h.tenant, original.document.id).await.unwrap();
    assert_eq!(stored.document.status, DocumentStatus::Voided);
}

#[tokio::test]
async fn test_reactivate_active_document_rejected() {
    let h = harness(10).await;
    let created = h.create(2).await;

    let err = h
        .service
        .reactivate_document(h.tenant, created.document.id, h.user)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidDocumentState { .. }));
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_moves_document_to_trash() {
    let h = harness(10).await;
    let created = h.create(3).await;

    let trashed = h
        .service
        .delete_document(h.tenant, created.document.id, "entered twice".to_string(), h.user)
        .await
        .unwrap();

    assert_eq!(trashed.original.id, created.document.id);
    assert_eq!(h.plan_available().await, 10);

    let tables = h.service.store().tables().await;
    assert!(tables.documents.is_empty());
    assert!(!tables.lines.contains_key(&created.document.id));
    assert_eq!(tables.trashed_documents.len(), 1);
    assert_eq!(tables.trashed_lines.len(), 3);
    assert_eq!(tables.operation_logs[0].kind, OperationKind::Delete);
    // The consumption trail survives, detached from the document.
    assert!(!tables.consumption.is_empty());
    assert!(tables.consumption.iter().all(|e| e.document_id.is_none()));

    let missing = h.service.get_document(h.tenant, created.document.id).await.unwrap_err();
    assert!(matches!(missing, LedgerError::DocumentNotFound(_)));
}

#[tokio::test]
async fn test_delete_releases_only_the_last_number() {
    let h = harness(20).await;
    let first = h.create(2).await;
    let second = h.create(2).await;

    h.service
        .delete_document(h.tenant, first.document.id, "gap".to_string(), h.user)
        .await
        .unwrap();
    assert_eq!(h.create(2).await.document.sequence_number, 3);

    let third_id = {
        let tables = h.service.store().tables().await;
        tables
            .documents
            .values()
            .find(|d| d.sequence_number == 3)
            .unwrap()
            .id
    };
    h.service
        .delete_document(h.tenant, third_id, "last".to_string(), h.user)
        .await
        .unwrap();
    assert_eq!(h.create(2).await.document.sequence_number, 3);
    assert_eq!(second.document.sequence_number, 2);
}

#[tokio::test]
async fn test_delete_in_closed_period_rejected() {
    let h = harness(10).await;
    let created = h.create(2).await;
    h.clock.set_date(day(2025, 2, 3));
    h.service.close_period(h.tenant, 2025, 1, None).await.unwrap();

    let err = h
        .service
        .delete_document(h.tenant, created.document.id, "late".to_string(), h.user)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::PeriodClosed { year: 2025, month: 1, .. }));
    assert!(h.service.get_document(h.tenant, created.document.id).await.is_ok());
}

#[tokio::test]
async fn test_reverse_consumption_after_delete_is_a_no_op() {
    let h = harness(10).await;
    let created = h.create(2).await;
    h.service
        .delete_document(h.tenant, created.document.id, "gone".to_string(), h.user)
        .await
        .unwrap();

    let reversed = h
        .service
        .reverse_consumption(h.tenant, created.document.id)
        .await
        .unwrap();

    assert!(reversed.is_empty());
    assert_eq!(h.plan_available().await, 10);
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn test_update_charges_the_line_delta() {
    let h = harness(10).await;
    let created = h.create(2).await;
    assert_eq!(h.plan_available().await, 8);

    let updated = h
        .service
        .update_document(h.update_input(created.document.id, balanced(5)))
        .await
        .unwrap();

    assert_eq!(updated.lines.len(), 5);
    assert_eq!(updated.document.date, day(2025, 1, 12));
    assert_eq!(h.plan_available().await, 5);

    let tables = h.service.store().tables().await;
    assert_eq!(tables.operation_logs[0].kind, OperationKind::Modify);
    let consumed: i64 = tables
        .consumption
        .iter()
        .filter(|e| e.op == ConsumptionOp::Consume)
        .map(|e| e.amount)
        .sum();
    let reversed: i64 = tables
        .consumption
        .iter()
        .filter(|e| e.op == ConsumptionOp::Reverse)
        .map(|e| e.amount)
        .sum();
    assert_eq!(consumed - reversed, 5);
}

#[tokio::test]
async fn test_update_into_closed_period_rejected() {
    let h = harness(10).await;
    h.service.close_period(h.tenant, 2024, 12, None).await.unwrap();
    let created = h.create(2).await;
    let mut input = h.update_input(created.document.id, balanced(2));
    input.date = day(2024, 12, 31);

    let err = h.service.update_document(input).await.unwrap_err();

    assert!(matches!(err, LedgerError::PeriodClosed { year: 2024, month: 12, .. }));
    assert_eq!(h.plan_available().await, 8);
}

#[tokio::test]
async fn test_update_voided_document_rejected() {
    let h = harness(10).await;
    let created = h.create(2).await;
    h.service
        .void_document(h.tenant, created.document.id, "x".to_string(), h.user)
        .await
        .unwrap();

    let err = h
        .service
        .update_document(h.update_input(created.document.id, balanced(2)))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidDocumentState { .. }));
}

// ============================================================================
// Collaborators
// ============================================================================

#[tokio::test]
async fn test_counterparty_recalculated_after_commit() {
    let h = harness(10).await;
    h.configure(DocumentTypeSettings {
        counterparty_ledger: Some(CounterpartyLedger::Receivable),
        ..DocumentTypeSettings::default()
    })
    .await;
    let customer = CounterpartyId::new();
    let other = CounterpartyId::new();
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.counterparty_id = Some(customer);

    let created = h.service.create_document(input).await.unwrap();
    assert_eq!(*h.balances.calls.lock().unwrap(), vec![customer]);

    let mut update = h.update_input(created.document.id, balanced(2));
    update.counterparty_id = Some(other);
    h.service.update_document(update).await.unwrap();

    let calls = h.balances.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls[1..].contains(&customer));
    assert!(calls[1..].contains(&other));
}

#[tokio::test]
async fn test_no_recalculation_when_unit_fails() {
    let h = harness(1).await;
    h.configure(DocumentTypeSettings {
        counterparty_ledger: Some(CounterpartyLedger::Payable),
        ..DocumentTypeSettings::default()
    })
    .await;
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.counterparty_id = Some(CounterpartyId::new());

    assert!(h.service.create_document(input).await.is_err());

    assert!(h.balances.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_plain_document_types_skip_collaborators() {
    let h = harness(10).await;
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.counterparty_id = Some(CounterpartyId::new());
    input.lines[0] = input.lines[0].clone().with_product(ProductId::new(), dec!(2));

    h.service.create_document(input).await.unwrap();

    assert!(h.balances.calls.lock().unwrap().is_empty());
    assert!(h.inventory.posted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_inventory_movements_follow_the_document() {
    let h = harness(10).await;
    h.configure(DocumentTypeSettings {
        inventory_effect: Some(MovementKind::In),
        ..DocumentTypeSettings::default()
    })
    .await;
    let product = ProductId::new();
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.lines[0] = input.lines[0].clone().with_product(product, dec!(4));

    let created = h.service.create_document(input).await.unwrap();
    {
        let posted = h.inventory.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].product_id, product);
        assert_eq!(posted[0].kind, MovementKind::In);
        assert_eq!(posted[0].unit_cost, dec!(25));
    }

    h.service
        .void_document(h.tenant, created.document.id, "x".to_string(), h.user)
        .await
        .unwrap();
    assert_eq!(*h.inventory.reversed.lock().unwrap(), vec![created.document.id]);

    h.service
        .delete_document(h.tenant, created.document.id, "y".to_string(), h.user)
        .await
        .unwrap();
    // Already reversed by the void; delete only recomputes.
    assert_eq!(h.inventory.reversed.lock().unwrap().len(), 1);
    assert_eq!(*h.inventory.recomputed.lock().unwrap(), vec![product]);
}

#[tokio::test]
async fn test_inventory_failure_aborts_the_unit() {
    let h = harness(10).await;
    h.configure(DocumentTypeSettings {
        inventory_effect: Some(MovementKind::Out),
        ..DocumentTypeSettings::default()
    })
    .await;
    h.inventory.fail_posts.store(true, Ordering::SeqCst);
    let mut input = h.input(day(2025, 1, 10), balanced(2));
    input.lines[0] = input.lines[0].clone().with_product(ProductId::new(), dec!(1));

    let err = h.service.create_document(input).await.unwrap_err();

    assert!(matches!(err, LedgerError::Collaborator(_)));
    assert_eq!(h.plan_available().await, 10);
    let tables = h.service.store().tables().await;
    assert!(tables.documents.is_empty());
    assert_eq!(tables.sequences[&(h.tenant, h.doc_type)].current_number, 0);
    // The partial post was compensated.
    assert_eq!(h.inventory.reversed.lock().unwrap().len(), 1);
}

// ============================================================================
// Periods and quota through the service
// ============================================================================

#[tokio::test]
async fn test_close_then_spend_overflow_next_month() {
    let h = harness(500).await;
    h.clock.set_date(day(2025, 2, 1));

    let closed = h.service.close_period(h.tenant, 2025, 1, None).await.unwrap();
    assert_eq!(closed.rolled_over, 500);
    assert_eq!(closed.overflow_pool.as_ref().unwrap().expiry_date, day(2026, 1, 31));

    h.service.provision_plan(h.tenant, 2025, 2, 300).await.unwrap();
    assert!(h.service.check_available(h.tenant, 800).await.unwrap());
    assert!(!h.service.check_available(h.tenant, 801).await.unwrap());

    let mut input = h.input(day(2025, 2, 5), balanced(2));
    input.description = None;
    h.service.create_document(input).await.unwrap();
    let status = h.service.quota_status(h.tenant).await.unwrap();
    assert_eq!(status.plan_available, 298);
    assert_eq!(status.overflow_available(), 500);
}

#[tokio::test]
async fn test_reopen_through_service() {
    let h = harness(50).await;
    h.clock.set_date(day(2025, 2, 1));
    h.service.close_period(h.tenant, 2025, 1, None).await.unwrap();

    let reopened = h.service.reopen_period(h.tenant, 2025, 1, None).await.unwrap();

    assert_eq!(reopened.restored_to_plan, 50);
    let tables = h.service.store().tables().await;
    assert!(tables.plans.values().all(|p| p.state == PlanState::Open));
}

#[tokio::test]
async fn test_invalid_month_rejected() {
    let h = harness(1).await;

    let err = h.service.close_period(h.tenant, 2025, 13, None).await.unwrap_err();

    assert!(matches!(err, LedgerError::InvalidPeriod { year: 2025, month: 13 }));
}
