//! Storage ports for the ledger.
//!
//! Every mutating ledger operation runs inside one [`LedgerTx`]: either all of its
//! writes become visible together on [`LedgerTx::commit`], or none do. Dropping a
//! transaction without committing rolls it back.
//!
//! Methods named `lock_*` read rows under an exclusive row lock held until the
//! transaction ends. [`LedgerTx::lock_period`] locks a month rather than a row:
//! document writers hold it shared, close and reopen hold it exclusive.
//! Implementations must take locks in the order the service asks for them. The
//! service goes document (when the operation targets one), months in ascending
//! order, sequence, plan, pools, top-ups; close and reopen start at the months.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use tally_shared::types::{DocumentId, DocumentTypeId, OverflowPoolId, QuotaPlanId, TenantId, TopUpId};
use thiserror::Error;

use crate::fiscal::{ClosedPeriod, YearMonth};
use crate::ledger::types::{
    DocumentStatus, DocumentTypeSequence, DocumentWithLines, LedgerDocument, LineEntry,
    OperationLog, TrashedDocument, TrashedLineEntry,
};
use crate::quota::types::{ConsumptionLedgerEntry, OverflowPool, QuotaPlanPeriod, TopUp};

pub use memory::MemoryLedgerStore;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A row the write expected to exist is gone.
    #[error("Row not found: {0}")]
    MissingRow(String),

    /// A stored value could not be mapped back to a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Any other backend failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// How a unit holds a month lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodLock {
    /// Held by units writing documents dated in the month.
    Shared,
    /// Held by units closing or reopening the month.
    Exclusive,
}

/// Quota rows relevant to spending in one month, in draw order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaSources {
    /// The month's plan, if provisioned.
    pub plan: Option<QuotaPlanPeriod>,
    /// ACTIVE pools with units left and expiry on or after today, oldest origin first.
    pub pools: Vec<OverflowPool>,
    /// The month's top-ups in purchase order.
    pub top_ups: Vec<TopUp>,
}

/// A transactional ledger store.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Transaction handle type.
    type Tx: LedgerTx + 'static;

    /// Starts a unit of work.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Reads a document and its lines outside any unit of work.
    async fn find_document(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Option<DocumentWithLines>, StoreError>;

    /// Reads the quota rows that could be drawn on `today`, without locking.
    async fn quota_sources(
        &self,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<QuotaSources, StoreError>;
}

/// Reads and writes available inside a unit of work.
#[async_trait]
pub trait LedgerTx: Send {
    /// Makes every write of the unit visible atomically.
    async fn commit(self) -> Result<(), StoreError>;

    // ---- closed periods ----

    /// Locks a month of a tenant until the unit ends. A shared holder and an
    /// exclusive holder of the same month never overlap.
    async fn lock_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
        mode: PeriodLock,
    ) -> Result<(), StoreError>;

    /// Reads the closed-period row for a month.
    async fn closed_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Option<ClosedPeriod>, StoreError>;

    /// Inserts a closed-period row.
    async fn insert_closed_period(&mut self, row: &ClosedPeriod) -> Result<(), StoreError>;

    /// Deletes the closed-period row for a month.
    async fn delete_closed_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<(), StoreError>;

    // ---- sequences ----

    /// Locks the numbering row of a document type.
    async fn lock_sequence(
        &mut self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
    ) -> Result<Option<DocumentTypeSequence>, StoreError>;

    /// Inserts a numbering row.
    async fn insert_sequence(&mut self, sequence: &DocumentTypeSequence) -> Result<(), StoreError>;

    /// Updates a numbering row.
    async fn update_sequence(&mut self, sequence: &DocumentTypeSequence) -> Result<(), StoreError>;

    // ---- documents ----

    /// Locks a document header.
    async fn lock_document(
        &mut self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Option<LedgerDocument>, StoreError>;

    /// Reads the lines of a document in position order.
    async fn lines_of(&mut self, document_id: DocumentId) -> Result<Vec<LineEntry>, StoreError>;

    /// Lists live documents holding a number, with their status.
    async fn documents_with_number(
        &mut self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        number: i64,
    ) -> Result<Vec<(DocumentId, DocumentStatus)>, StoreError>;

    /// Inserts a document header.
    async fn insert_document(&mut self, document: &LedgerDocument) -> Result<(), StoreError>;

    /// Updates a document header.
    async fn update_document(&mut self, document: &LedgerDocument) -> Result<(), StoreError>;

    /// Replaces all lines of a document.
    async fn replace_lines(
        &mut self,
        document_id: DocumentId,
        lines: &[LineEntry],
    ) -> Result<(), StoreError>;

    /// Deletes a document header and its lines.
    async fn delete_document(&mut self, document_id: DocumentId) -> Result<(), StoreError>;

    /// Archives a deleted document and its lines.
    async fn insert_trashed(
        &mut self,
        document: &TrashedDocument,
        lines: &[TrashedLineEntry],
    ) -> Result<(), StoreError>;

    /// Appends an audit entry.
    async fn append_operation_log(&mut self, entry: &OperationLog) -> Result<(), StoreError>;

    // ---- quota plans ----

    /// Locks the plan of a month.
    async fn lock_plan(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Option<QuotaPlanPeriod>, StoreError>;

    /// Locks a plan by ID.
    async fn lock_plan_by_id(&mut self, id: QuotaPlanId) -> Result<Option<QuotaPlanPeriod>, StoreError>;

    /// Earliest month with a plan, i.e. the tenant's first operating month.
    async fn earliest_plan_period(&mut self, tenant_id: TenantId)
    -> Result<Option<YearMonth>, StoreError>;

    /// Inserts a plan.
    async fn insert_plan(&mut self, plan: &QuotaPlanPeriod) -> Result<(), StoreError>;

    /// Updates a plan.
    async fn update_plan(&mut self, plan: &QuotaPlanPeriod) -> Result<(), StoreError>;

    // ---- overflow pools ----

    /// Locks the pools that can be drawn on `today`, oldest origin first, then creation order.
    async fn lock_spendable_pools(
        &mut self,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<Vec<OverflowPool>, StoreError>;

    /// Locks a pool by ID.
    async fn lock_pool(&mut self, id: OverflowPoolId) -> Result<Option<OverflowPool>, StoreError>;

    /// Locks every pool that rolled over from a month, in creation order.
    async fn lock_pools_by_origin(
        &mut self,
        tenant_id: TenantId,
        origin: YearMonth,
    ) -> Result<Vec<OverflowPool>, StoreError>;

    /// Inserts a pool.
    async fn insert_pool(&mut self, pool: &OverflowPool) -> Result<(), StoreError>;

    /// Updates a pool.
    async fn update_pool(&mut self, pool: &OverflowPool) -> Result<(), StoreError>;

    // ---- top-ups ----

    /// Locks every top-up of a month in purchase order, whatever its state.
    async fn lock_top_ups(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Vec<TopUp>, StoreError>;

    /// Locks a top-up by ID.
    async fn lock_top_up(&mut self, id: TopUpId) -> Result<Option<TopUp>, StoreError>;

    /// Inserts a top-up.
    async fn insert_top_up(&mut self, top_up: &TopUp) -> Result<(), StoreError>;

    /// Updates a top-up.
    async fn update_top_up(&mut self, top_up: &TopUp) -> Result<(), StoreError>;

    // ---- consumption ledger ----

    /// Appends a consumption ledger entry.
    async fn append_consumption(&mut self, entry: &ConsumptionLedgerEntry) -> Result<(), StoreError>;

    /// Entries attached to a document in creation order.
    async fn consumption_for_document(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Vec<ConsumptionLedgerEntry>, StoreError>;

    /// Clears the document reference of every entry attached to a document.
    async fn detach_consumption(&mut self, document_id: DocumentId) -> Result<u64, StoreError>;

    /// The most recent EXPIRE entry written for a top-up.
    async fn last_expiry_of(
        &mut self,
        top_up_id: TopUpId,
    ) -> Result<Option<ConsumptionLedgerEntry>, StoreError>;
}
