//! Document ledger orchestration.
//!
//! Each operation runs as one unit of work: period guard, numbering, document
//! rows, audit trail, quota and inventory either all land or none do. Inventory
//! calls cannot join the storage transaction, so the steps already applied are
//! compensated when the unit fails. Counterparty balances are recalculated only
//! after commit.

use std::sync::Arc;

use tally_shared::LedgerConfig;
use tally_shared::types::{
    CounterpartyId, DocumentId, DocumentTypeId, ProductId, TenantId, UserId, round_to_scale,
};
use tracing::{error, info, instrument};

use super::error::LedgerError;
use super::sequence::SequenceAllocator;
use super::types::{
    CreateDocumentInput, DocumentStatus, DocumentTypeSequence, DocumentTypeSettings,
    DocumentWithLines, LedgerDocument, LineEntry, MovementKind, OperationKind, OperationLog,
    TrashedDocument, TrashedLineEntry, UpdateDocumentInput, build_lines,
};
use super::validation::{validate_due_date, validate_lines};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{InventoryMovement, InventoryPort, NoopBalances, NoopInventory};
use crate::fiscal::{PeriodGuard, YearMonth};
use crate::quota::{
    CloseOutcome, ConsumptionLedgerEntry, ConsumptionMeter, PeriodCloser, QuotaPlanPeriod,
    QuotaStatus, QuotaUnits, ReopenOutcome, TopUp,
};
use crate::recalc::{RecalcRequest, RecalculationDispatcher};
use crate::store::{LedgerStore, LedgerTx, StoreError};

/// Document ledger service.
pub struct DocumentLedgerService<S: LedgerStore> {
    store: S,
    clock: Arc<dyn Clock>,
    inventory: Arc<dyn InventoryPort>,
    recalc: RecalculationDispatcher,
    config: LedgerConfig,
}

impl<S: LedgerStore> DocumentLedgerService<S> {
    /// Creates a service on the system clock with no inventory or AR/AP subsystems.
    #[must_use]
    pub fn new(store: S, config: LedgerConfig) -> Self {
        let recalc =
            RecalculationDispatcher::inline(Arc::new(NoopBalances), config.recalc_max_attempts);
        Self {
            store,
            clock: Arc::new(SystemClock),
            inventory: Arc::new(NoopInventory),
            recalc,
            config,
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the inventory subsystem.
    #[must_use]
    pub fn with_inventory(mut self, inventory: Arc<dyn InventoryPort>) -> Self {
        self.inventory = inventory;
        self
    }

    /// Replaces the counterparty recalculation dispatcher.
    #[must_use]
    pub fn with_recalculation(mut self, recalc: RecalculationDispatcher) -> Self {
        self.recalc = recalc;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Creates an ACTIVE document.
    ///
    /// # Errors
    ///
    /// `PeriodClosed`, validation errors, numbering errors, `InsufficientQuota`,
    /// collaborator or storage errors. Nothing is persisted on error, the
    /// document number included.
    #[instrument(skip_all, fields(tenant_id = %input.tenant_id, doc_type_id = %input.doc_type_id))]
    pub async fn create_document(
        &self,
        input: CreateDocumentInput,
    ) -> Result<DocumentWithLines, LedgerError> {
        let mut tx = self.store.begin().await?;
        let mut journal = InventoryJournal::new(self.inventory.as_ref());
        let result = self.create_in(&mut tx, &mut journal, input).await;
        let (created, recalc) = Self::finish(tx, journal, result).await?;

        info!(
            document_id = %created.document.id,
            number = created.document.sequence_number,
            lines = created.lines.len(),
            "document created"
        );
        self.recalc.dispatch(recalc).await;
        Ok(created)
    }

    async fn create_in(
        &self,
        tx: &mut S::Tx,
        journal: &mut InventoryJournal<'_>,
        input: CreateDocumentInput,
    ) -> Result<(DocumentWithLines, Vec<RecalcRequest>), LedgerError> {
        let now = self.clock.now();
        let tenant_id = input.tenant_id;

        PeriodGuard::assert_open(tx, tenant_id, input.date).await?;
        validate_lines(&input.lines)?;
        validate_due_date(input.date, input.due_date)?;

        let mut sequence = SequenceAllocator::lock_or_init(tx, tenant_id, input.doc_type_id).await?;
        let number = SequenceAllocator::next_number(tx, &mut sequence, input.number).await?;

        let document = LedgerDocument {
            id: DocumentId::new(),
            tenant_id,
            doc_type_id: input.doc_type_id,
            sequence_number: number,
            date: input.date,
            due_date: input.due_date,
            counterparty_id: input.counterparty_id,
            cost_center_id: input.cost_center_id,
            warehouse_id: input.warehouse_id,
            description: input.description,
            status: DocumentStatus::Active,
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
            voided_at: None,
            voided_by: None,
            void_reason: None,
        };
        tx.insert_document(&document)
            .await
            .map_err(number_conflict(&document))?;

        let lines = build_lines(document.id, input.lines);
        tx.replace_lines(document.id, &lines).await?;

        let units = QuotaUnits::from_count(lines.len())?.get();
        ConsumptionMeter::consume(tx, tenant_id, units, Some(document.id), self.clock.today(), now)
            .await?;

        if let Some(kind) = sequence.inventory_effect {
            journal
                .post(document.id, movements(&document, &lines, kind))
                .await?;
        }

        let recalc = recalc_requests(&sequence, tenant_id, [document.counterparty_id]);
        Ok((DocumentWithLines { document, lines }, recalc))
    }

    /// Voids an ACTIVE document: its quota and inventory effects are reversed, the
    /// document is kept for audit.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound`, `PeriodClosed`, `InvalidDocumentState`, collaborator or
    /// storage errors.
    #[instrument(skip_all, fields(%tenant_id, %document_id))]
    pub async fn void_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        reason: String,
        actor: UserId,
    ) -> Result<LedgerDocument, LedgerError> {
        let mut tx = self.store.begin().await?;
        let mut journal = InventoryJournal::new(self.inventory.as_ref());
        let result = self
            .void_in(&mut tx, &mut journal, tenant_id, document_id, reason, actor)
            .await;
        let (voided, recalc) = Self::finish(tx, journal, result).await?;

        info!(number = voided.sequence_number, "document voided");
        self.recalc.dispatch(recalc).await;
        Ok(voided)
    }

    async fn void_in(
        &self,
        tx: &mut S::Tx,
        journal: &mut InventoryJournal<'_>,
        tenant_id: TenantId,
        document_id: DocumentId,
        reason: String,
        actor: UserId,
    ) -> Result<(LedgerDocument, Vec<RecalcRequest>), LedgerError> {
        let now = self.clock.now();
        let mut document = locked_document(tx, tenant_id, document_id).await?;
        PeriodGuard::assert_open(tx, tenant_id, document.date).await?;
        expect_status(&document, DocumentStatus::Active)?;
        let sequence =
            SequenceAllocator::lock_or_init(tx, tenant_id, document.doc_type_id).await?;

        let lines = tx.lines_of(document_id).await?;
        let before = DocumentWithLines {
            document: document.clone(),
            lines,
        };
        let log = OperationLog::snapshot_of(
            &before,
            OperationKind::Void,
            Some(reason.clone()),
            actor,
            now,
        )?;
        tx.append_operation_log(&log).await?;

        document.status = DocumentStatus::Voided;
        document.voided_at = Some(now);
        document.voided_by = Some(actor);
        document.void_reason = Some(reason);
        document.updated_at = now;
        tx.update_document(&document).await?;

        ConsumptionMeter::reverse(tx, tenant_id, document_id, now).await?;

        if let Some(kind) = sequence.inventory_effect {
            journal
                .reverse(document_id, movements(&before.document, &before.lines, kind))
                .await?;
        }

        let recalc = recalc_requests(&sequence, tenant_id, [document.counterparty_id]);
        Ok((document, recalc))
    }

    /// Restores a VOIDED document to ACTIVE with its original number and lines.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound`, `PeriodClosed`, `InvalidDocumentState`,
    /// `SequenceConflict` if an ACTIVE document now holds the number,
    /// `InsufficientQuota`, collaborator or storage errors.
    #[instrument(skip_all, fields(%tenant_id, %document_id))]
    pub async fn reactivate_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        actor: UserId,
    ) -> Result<LedgerDocument, LedgerError> {
        let mut tx = self.store.begin().await?;
        let mut journal = InventoryJournal::new(self.inventory.as_ref());
        let result = self
            .reactivate_in(&mut tx, &mut journal, tenant_id, document_id, actor)
            .await;
        let (document, recalc) = Self::finish(tx, journal, result).await?;

        info!(number = document.sequence_number, "document reactivated");
        self.recalc.dispatch(recalc).await;
        Ok(document)
    }

    async fn reactivate_in(
        &self,
        tx: &mut S::Tx,
        journal: &mut InventoryJournal<'_>,
        tenant_id: TenantId,
        document_id: DocumentId,
        actor: UserId,
    ) -> Result<(LedgerDocument, Vec<RecalcRequest>), LedgerError> {
        let now = self.clock.now();
        let mut document = locked_document(tx, tenant_id, document_id).await?;
        PeriodGuard::assert_open(tx, tenant_id, document.date).await?;
        expect_status(&document, DocumentStatus::Voided)?;
        let sequence =
            SequenceAllocator::lock_or_init(tx, tenant_id, document.doc_type_id).await?;

        SequenceAllocator::ensure_free(
            tx,
            tenant_id,
            document.doc_type_id,
            document.sequence_number,
            Some(document_id),
        )
        .await?;

        let lines = tx.lines_of(document_id).await?;
        let before = DocumentWithLines {
            document: document.clone(),
            lines,
        };
        let log = OperationLog::snapshot_of(&before, OperationKind::Reactivate, None, actor, now)?;
        tx.append_operation_log(&log).await?;

        document.status = DocumentStatus::Active;
        document.voided_at = None;
        document.voided_by = None;
        document.void_reason = None;
        document.updated_at = now;
        tx.update_document(&document)
            .await
            .map_err(number_conflict(&document))?;

        let units = QuotaUnits::from_count(before.lines.len())?.get();
        ConsumptionMeter::consume(tx, tenant_id, units, Some(document_id), self.clock.today(), now)
            .await?;

        if let Some(kind) = sequence.inventory_effect {
            journal
                .post(document_id, movements(&document, &before.lines, kind))
                .await?;
        }

        let recalc = recalc_requests(&sequence, tenant_id, [document.counterparty_id]);
        Ok((document, recalc))
    }

    /// Moves a document to the trash. Irreversible from here.
    ///
    /// The consumption trail stays, detached from the document. The sequence
    /// counter steps back if this was the most recent number.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound`, `PeriodClosed`, collaborator or storage errors.
    #[instrument(skip_all, fields(%tenant_id, %document_id))]
    pub async fn delete_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        reason: String,
        actor: UserId,
    ) -> Result<TrashedDocument, LedgerError> {
        let mut tx = self.store.begin().await?;
        let mut journal = InventoryJournal::new(self.inventory.as_ref());
        let result = self
            .delete_in(&mut tx, &mut journal, tenant_id, document_id, reason, actor)
            .await;
        let (trashed, recalc) = Self::finish(tx, journal, result).await?;

        info!(number = trashed.original.sequence_number, "document deleted");
        self.recalc.dispatch(recalc).await;
        Ok(trashed)
    }

    async fn delete_in(
        &self,
        tx: &mut S::Tx,
        journal: &mut InventoryJournal<'_>,
        tenant_id: TenantId,
        document_id: DocumentId,
        reason: String,
        actor: UserId,
    ) -> Result<(TrashedDocument, Vec<RecalcRequest>), LedgerError> {
        let now = self.clock.now();
        let document = locked_document(tx, tenant_id, document_id).await?;
        PeriodGuard::assert_open(tx, tenant_id, document.date).await?;
        let sequence =
            SequenceAllocator::lock_or_init(tx, tenant_id, document.doc_type_id).await?;

        let lines = tx.lines_of(document_id).await?;
        let trashed = TrashedDocument {
            original: document.clone(),
            deletion_reason: reason.clone(),
            deleted_by: actor,
            deleted_at: now,
        };
        let trashed_lines: Vec<TrashedLineEntry> = lines
            .iter()
            .map(|line| TrashedLineEntry {
                original: line.clone(),
                deleted_at: now,
            })
            .collect();
        tx.insert_trashed(&trashed, &trashed_lines).await?;

        let before = DocumentWithLines { document, lines };
        let log =
            OperationLog::snapshot_of(&before, OperationKind::Delete, Some(reason), actor, now)?;
        tx.append_operation_log(&log).await?;

        ConsumptionMeter::reverse(tx, tenant_id, document_id, now).await?;
        tx.detach_consumption(document_id).await?;
        tx.delete_document(document_id).await?;
        SequenceAllocator::release_if_last(
            tx,
            tenant_id,
            before.document.doc_type_id,
            before.document.sequence_number,
        )
        .await?;

        if let Some(kind) = sequence.inventory_effect {
            // A voided document already had its movements reversed.
            if before.document.status == DocumentStatus::Active {
                journal
                    .reverse(document_id, movements(&before.document, &before.lines, kind))
                    .await?;
            }
            journal.recompute(&product_ids(&before.lines)).await?;
        }

        let recalc = recalc_requests(&sequence, tenant_id, [before.document.counterparty_id]);
        Ok((trashed, recalc))
    }

    /// Updates an ACTIVE document, replacing its lines wholesale.
    ///
    /// Quota follows the line count: outstanding consumption is reversed and the
    /// new count consumed.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound`, `PeriodClosed` for the old or new date,
    /// `InvalidDocumentState`, validation errors, `InsufficientQuota`,
    /// collaborator or storage errors.
    #[instrument(skip_all, fields(tenant_id = %input.tenant_id, document_id = %input.document_id))]
    pub async fn update_document(
        &self,
        input: UpdateDocumentInput,
    ) -> Result<DocumentWithLines, LedgerError> {
        let mut tx = self.store.begin().await?;
        let mut journal = InventoryJournal::new(self.inventory.as_ref());
        let result = self.update_in(&mut tx, &mut journal, input).await;
        let (updated, recalc) = Self::finish(tx, journal, result).await?;

        info!(lines = updated.lines.len(), "document updated");
        self.recalc.dispatch(recalc).await;
        Ok(updated)
    }

    async fn update_in(
        &self,
        tx: &mut S::Tx,
        journal: &mut InventoryJournal<'_>,
        input: UpdateDocumentInput,
    ) -> Result<(DocumentWithLines, Vec<RecalcRequest>), LedgerError> {
        let now = self.clock.now();
        let tenant_id = input.tenant_id;
        let document_id = input.document_id;

        let mut document = locked_document(tx, tenant_id, document_id).await?;
        PeriodGuard::assert_all_open(tx, tenant_id, &[document.date, input.date]).await?;
        expect_status(&document, DocumentStatus::Active)?;
        validate_lines(&input.lines)?;
        validate_due_date(input.date, input.due_date)?;
        let sequence =
            SequenceAllocator::lock_or_init(tx, tenant_id, document.doc_type_id).await?;

        let old_lines = tx.lines_of(document_id).await?;
        let before = DocumentWithLines {
            document: document.clone(),
            lines: old_lines,
        };
        let log = OperationLog::snapshot_of(&before, OperationKind::Modify, None, input.actor, now)?;
        tx.append_operation_log(&log).await?;

        ConsumptionMeter::reverse(tx, tenant_id, document_id, now).await?;

        let lines = build_lines(document_id, input.lines);
        tx.replace_lines(document_id, &lines).await?;

        document.date = input.date;
        document.due_date = input.due_date;
        document.counterparty_id = input.counterparty_id;
        document.cost_center_id = input.cost_center_id;
        document.updated_at = now;
        tx.update_document(&document).await?;

        let units = QuotaUnits::from_count(lines.len())?.get();
        ConsumptionMeter::consume(tx, tenant_id, units, Some(document_id), self.clock.today(), now)
            .await?;

        if let Some(kind) = sequence.inventory_effect {
            journal
                .reverse(document_id, movements(&before.document, &before.lines, kind))
                .await?;
            journal
                .post(document_id, movements(&document, &lines, kind))
                .await?;
        }

        let recalc = recalc_requests(
            &sequence,
            tenant_id,
            [before.document.counterparty_id, document.counterparty_id],
        );
        Ok((DocumentWithLines { document, lines }, recalc))
    }

    /// Reads a live document with its lines.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound` or a storage error.
    pub async fn get_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<DocumentWithLines, LedgerError> {
        self.store
            .find_document(tenant_id, document_id)
            .await?
            .ok_or(LedgerError::DocumentNotFound(document_id))
    }

    /// Sets numbering mode and collaborator flags of a document type.
    ///
    /// # Errors
    ///
    /// Storage errors.
    #[instrument(skip(self, settings))]
    pub async fn configure_document_type(
        &self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        settings: DocumentTypeSettings,
    ) -> Result<DocumentTypeSequence, LedgerError> {
        let mut tx = self.store.begin().await?;
        let sequence = SequenceAllocator::configure(&mut tx, tenant_id, doc_type_id, settings).await?;
        tx.commit().await?;
        Ok(sequence)
    }

    // ========================================================================
    // Periods and quota
    // ========================================================================

    /// Closes a month: fiscal lock plus quota rollover.
    ///
    /// # Errors
    ///
    /// `InvalidPeriod`, `PreviousPeriodOpen`, or a storage error.
    #[instrument(skip(self))]
    pub async fn close_period(
        &self,
        tenant_id: TenantId,
        year: i32,
        month: u32,
        actor: Option<UserId>,
    ) -> Result<CloseOutcome, LedgerError> {
        let period = period(year, month)?;
        let mut tx = self.store.begin().await?;
        let outcome = PeriodCloser::close(
            &mut tx,
            tenant_id,
            period,
            actor,
            self.config.overflow_lifetime_months,
            self.clock.now(),
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Reopens a closed month.
    ///
    /// # Errors
    ///
    /// `InvalidPeriod`, `PeriodNotClosed`, `FollowingPeriodClosed`, or a storage error.
    #[instrument(skip(self))]
    pub async fn reopen_period(
        &self,
        tenant_id: TenantId,
        year: i32,
        month: u32,
        actor: Option<UserId>,
    ) -> Result<ReopenOutcome, LedgerError> {
        let period = period(year, month)?;
        let mut tx = self.store.begin().await?;
        let outcome =
            PeriodCloser::reopen(&mut tx, tenant_id, period, actor, self.clock.now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Spendable quota right now. Lock-free.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn quota_status(&self, tenant_id: TenantId) -> Result<QuotaStatus, LedgerError> {
        ConsumptionMeter::status(&self.store, tenant_id, self.clock.today()).await
    }

    /// Advisory check that `units` could be consumed right now. Not a reservation.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` for negative units, or a storage error.
    pub async fn check_available(&self, tenant_id: TenantId, units: i64) -> Result<bool, LedgerError> {
        ConsumptionMeter::check_available(&self.store, tenant_id, units, self.clock.today()).await
    }

    /// Creates or resizes the plan of an open month.
    ///
    /// # Errors
    ///
    /// `InvalidPeriod`, `InvalidQuantity`, `PlanNotOpen`, or a storage error.
    pub async fn provision_plan(
        &self,
        tenant_id: TenantId,
        year: i32,
        month: u32,
        allocated: i64,
    ) -> Result<QuotaPlanPeriod, LedgerError> {
        let period = period(year, month)?;
        let mut tx = self.store.begin().await?;
        let plan =
            ConsumptionMeter::provision_plan(&mut tx, tenant_id, period, allocated, self.clock.now())
                .await?;
        tx.commit().await?;
        Ok(plan)
    }

    /// Buys extra units for a month that is not closed.
    ///
    /// # Errors
    ///
    /// `InvalidPeriod`, `InvalidQuantity`, `PlanNotOpen`, or a storage error.
    pub async fn purchase_top_up(
        &self,
        tenant_id: TenantId,
        year: i32,
        month: u32,
        amount: i64,
    ) -> Result<TopUp, LedgerError> {
        let period = period(year, month)?;
        let mut tx = self.store.begin().await?;
        let top_up =
            ConsumptionMeter::purchase_top_up(&mut tx, tenant_id, period, amount, self.clock.now())
                .await?;
        tx.commit().await?;
        Ok(top_up)
    }

    /// Reverses whatever quota a document still holds. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// `QuotaInvariant` or a storage error.
    pub async fn reverse_consumption(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Vec<ConsumptionLedgerEntry>, LedgerError> {
        let mut tx = self.store.begin().await?;
        let reversed =
            ConsumptionMeter::reverse(&mut tx, tenant_id, document_id, self.clock.now()).await?;
        tx.commit().await?;
        Ok(reversed)
    }

    /// Commits on success; on failure rolls back and undoes inventory steps.
    async fn finish<T>(
        tx: S::Tx,
        journal: InventoryJournal<'_>,
        result: Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        match result {
            Ok(value) => {
                if let Err(e) = tx.commit().await {
                    journal.compensate().await;
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                drop(tx);
                journal.compensate().await;
                Err(e)
            }
        }
    }
}

fn period(year: i32, month: u32) -> Result<YearMonth, LedgerError> {
    YearMonth::new(year, month).ok_or(LedgerError::InvalidPeriod { year, month })
}

async fn locked_document<T: LedgerTx>(
    tx: &mut T,
    tenant_id: TenantId,
    document_id: DocumentId,
) -> Result<LedgerDocument, LedgerError> {
    tx.lock_document(tenant_id, document_id)
        .await?
        .ok_or(LedgerError::DocumentNotFound(document_id))
}

fn expect_status(document: &LedgerDocument, expected: DocumentStatus) -> Result<(), LedgerError> {
    if document.status == expected {
        Ok(())
    } else {
        Err(LedgerError::InvalidDocumentState {
            document_id: document.id,
            expected,
            actual: document.status,
        })
    }
}

/// Maps a uniqueness failure on a document write to a numbering conflict.
fn number_conflict(document: &LedgerDocument) -> impl FnOnce(StoreError) -> LedgerError + use<> {
    let doc_type_id = document.doc_type_id;
    let number = document.sequence_number;
    move |e| match e {
        StoreError::UniqueViolation(_) => LedgerError::SequenceConflict {
            doc_type_id,
            number,
        },
        other => other.into(),
    }
}

fn recalc_requests(
    sequence: &DocumentTypeSequence,
    tenant_id: TenantId,
    counterparties: impl IntoIterator<Item = Option<CounterpartyId>>,
) -> Vec<RecalcRequest> {
    if !sequence.affects_counterparty_balances() {
        return Vec::new();
    }
    counterparties
        .into_iter()
        .flatten()
        .map(|counterparty_id| RecalcRequest {
            tenant_id,
            counterparty_id,
        })
        .collect()
}

fn movements(
    document: &LedgerDocument,
    lines: &[LineEntry],
    kind: MovementKind,
) -> Vec<InventoryMovement> {
    lines
        .iter()
        .filter_map(|line| {
            let product_id = line.product_id?;
            let quantity = line.quantity?;
            let unit_cost = line.unit_cost.unwrap_or_else(|| {
                round_to_scale(line.amount().checked_div(quantity).unwrap_or_default())
            });
            Some(InventoryMovement {
                tenant_id: document.tenant_id,
                product_id,
                warehouse_id: document.warehouse_id,
                kind,
                quantity,
                unit_cost,
                document_id: document.id,
                date: document.date,
            })
        })
        .collect()
}

fn product_ids(lines: &[LineEntry]) -> Vec<ProductId> {
    let mut ids: Vec<ProductId> = lines.iter().filter_map(|l| l.product_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

enum InventoryStep {
    Posted(DocumentId),
    Reversed(Vec<InventoryMovement>),
}

/// Inventory calls made inside a unit, kept so they can be undone.
struct InventoryJournal<'a> {
    port: &'a dyn InventoryPort,
    steps: Vec<InventoryStep>,
}

impl<'a> InventoryJournal<'a> {
    fn new(port: &'a dyn InventoryPort) -> Self {
        Self {
            port,
            steps: Vec::new(),
        }
    }

    async fn post(
        &mut self,
        document_id: DocumentId,
        movements: Vec<InventoryMovement>,
    ) -> Result<(), LedgerError> {
        if movements.is_empty() {
            return Ok(());
        }
        // Recorded up front so a partial post is undone too.
        self.steps.push(InventoryStep::Posted(document_id));
        for movement in &movements {
            self.port
                .post_movement(movement)
                .await
                .map_err(|e| LedgerError::Collaborator(e.to_string()))?;
        }
        Ok(())
    }

    async fn reverse(
        &mut self,
        document_id: DocumentId,
        previous: Vec<InventoryMovement>,
    ) -> Result<(), LedgerError> {
        if previous.is_empty() {
            return Ok(());
        }
        self.port
            .reverse_movements_of(document_id)
            .await
            .map_err(|e| LedgerError::Collaborator(e.to_string()))?;
        self.steps.push(InventoryStep::Reversed(previous));
        Ok(())
    }

    async fn recompute(&self, product_ids: &[ProductId]) -> Result<(), LedgerError> {
        if product_ids.is_empty() {
            return Ok(());
        }
        self.port
            .recompute_balances(product_ids)
            .await
            .map_err(|e| LedgerError::Collaborator(e.to_string()))
    }

    async fn compensate(self) {
        for step in self.steps.into_iter().rev() {
            let result = match &step {
                InventoryStep::Posted(document_id) => {
                    self.port.reverse_movements_of(*document_id).await
                }
                InventoryStep::Reversed(movements) => {
                    let mut outcome = Ok(());
                    for movement in movements {
                        if let Err(e) = self.port.post_movement(movement).await {
                            outcome = Err(e);
                        }
                    }
                    outcome
                }
            };
            if let Err(e) = result {
                error!(error = %e, "inventory compensation failed; stock may need manual review");
            }
        }
    }
}
