//! In-memory ledger store.
//!
//! A single writer mutex serializes units of work, which stands in for row locks.
//! Each unit works on a private copy of the tables and swaps it in on commit, so
//! dropping a unit discards everything it wrote. Readers outside a unit see the
//! last committed tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tally_shared::types::{
    DocumentId, DocumentTypeId, OverflowPoolId, QuotaPlanId, TenantId, TopUpId,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{LedgerStore, LedgerTx, PeriodLock, QuotaSources, StoreError};
use crate::fiscal::{ClosedPeriod, YearMonth};
use crate::ledger::types::{
    DocumentStatus, DocumentTypeSequence, DocumentWithLines, LedgerDocument, LineEntry,
    OperationLog, TrashedDocument, TrashedLineEntry,
};
use crate::quota::types::{
    ConsumptionLedgerEntry, ConsumptionOp, OverflowPool, QuotaPlanPeriod, QuotaSource, TopUp,
    TopUpState,
};

/// Every table of the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    /// Closed months.
    pub closed_periods: BTreeMap<(TenantId, YearMonth), ClosedPeriod>,
    /// Numbering rows.
    pub sequences: HashMap<(TenantId, DocumentTypeId), DocumentTypeSequence>,
    /// Live document headers.
    pub documents: HashMap<DocumentId, LedgerDocument>,
    /// Live document lines.
    pub lines: HashMap<DocumentId, Vec<LineEntry>>,
    /// Deleted documents.
    pub trashed_documents: Vec<TrashedDocument>,
    /// Lines of deleted documents.
    pub trashed_lines: Vec<TrashedLineEntry>,
    /// Audit entries.
    pub operation_logs: Vec<OperationLog>,
    /// Monthly plans.
    pub plans: HashMap<QuotaPlanId, QuotaPlanPeriod>,
    /// Overflow pools.
    pub pools: HashMap<OverflowPoolId, OverflowPool>,
    /// Top-ups.
    pub top_ups: HashMap<TopUpId, TopUp>,
    /// Consumption ledger in append order.
    pub consumption: Vec<ConsumptionLedgerEntry>,
}

impl MemoryTables {
    fn plan_for(&self, tenant_id: TenantId, period: YearMonth) -> Option<&QuotaPlanPeriod> {
        self.plans
            .values()
            .find(|p| p.tenant_id == tenant_id && p.period() == period)
    }

    fn spendable_pools(&self, tenant_id: TenantId, today: NaiveDate) -> Vec<OverflowPool> {
        let mut pools: Vec<OverflowPool> = self
            .pools
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.is_spendable(today))
            .cloned()
            .collect();
        pools.sort_by_key(|p| (p.origin(), p.created_at, p.id));
        pools
    }

    fn top_ups_for(&self, tenant_id: TenantId, period: YearMonth) -> Vec<TopUp> {
        let mut top_ups: Vec<TopUp> = self
            .top_ups
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.period() == period)
            .cloned()
            .collect();
        top_ups.sort_by_key(|t| (t.purchased_at, t.id));
        top_ups
    }

    fn number_taken(&self, document: &LedgerDocument) -> bool {
        document.status == DocumentStatus::Active
            && self.documents.values().any(|other| {
                other.id != document.id
                    && other.tenant_id == document.tenant_id
                    && other.doc_type_id == document.doc_type_id
                    && other.sequence_number == document.sequence_number
                    && other.status == DocumentStatus::Active
            })
    }

    /// Consumption entries of a tenant in append order.
    #[must_use]
    pub fn consumption_of(&self, tenant_id: TenantId) -> Vec<&ConsumptionLedgerEntry> {
        self.consumption
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .collect()
    }

    /// Pools of a tenant in creation order.
    #[must_use]
    pub fn pools_of(&self, tenant_id: TenantId) -> Vec<&OverflowPool> {
        let mut pools: Vec<&OverflowPool> = self
            .pools
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .collect();
        pools.sort_by_key(|p| (p.created_at, p.id));
        pools
    }
}

/// Ledger store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    committed: Arc<RwLock<MemoryTables>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the committed tables.
    pub async fn tables(&self) -> MemoryTables {
        self.committed.read().await.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let working = self.committed.read().await.clone();
        Ok(MemoryTx {
            _guard: guard,
            working,
            committed: Arc::clone(&self.committed),
        })
    }

    async fn find_document(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Option<DocumentWithLines>, StoreError> {
        let tables = self.committed.read().await;
        Ok(tables
            .documents
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .map(|document| DocumentWithLines {
                document: document.clone(),
                lines: tables.lines.get(&id).cloned().unwrap_or_default(),
            }))
    }

    async fn quota_sources(
        &self,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<QuotaSources, StoreError> {
        let tables = self.committed.read().await;
        let period = YearMonth::from_date(today);
        Ok(QuotaSources {
            plan: tables.plan_for(tenant_id, period).cloned(),
            pools: tables.spendable_pools(tenant_id, today),
            top_ups: tables.top_ups_for(tenant_id, period),
        })
    }
}

/// A unit of work on [`MemoryLedgerStore`].
#[derive(Debug)]
pub struct MemoryTx {
    _guard: OwnedMutexGuard<()>,
    working: MemoryTables,
    committed: Arc<RwLock<MemoryTables>>,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn commit(self) -> Result<(), StoreError> {
        let Self {
            _guard,
            working,
            committed,
        } = self;
        *committed.write().await = working;
        Ok(())
    }

    async fn lock_period(
        &mut self,
        _tenant_id: TenantId,
        _period: YearMonth,
        _mode: PeriodLock,
    ) -> Result<(), StoreError> {
        // The writer mutex already excludes every other unit.
        Ok(())
    }

    async fn closed_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Option<ClosedPeriod>, StoreError> {
        Ok(self.working.closed_periods.get(&(tenant_id, period)).cloned())
    }

    async fn insert_closed_period(&mut self, row: &ClosedPeriod) -> Result<(), StoreError> {
        let key = (row.tenant_id, row.period());
        if self.working.closed_periods.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "closed period {} already exists",
                row.period()
            )));
        }
        self.working.closed_periods.insert(key, row.clone());
        Ok(())
    }

    async fn delete_closed_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<(), StoreError> {
        self.working.closed_periods.remove(&(tenant_id, period));
        Ok(())
    }

    async fn lock_sequence(
        &mut self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
    ) -> Result<Option<DocumentTypeSequence>, StoreError> {
        Ok(self.working.sequences.get(&(tenant_id, doc_type_id)).cloned())
    }

    async fn insert_sequence(&mut self, sequence: &DocumentTypeSequence) -> Result<(), StoreError> {
        let key = (sequence.tenant_id, sequence.doc_type_id);
        if self.working.sequences.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "sequence for document type {} already exists",
                sequence.doc_type_id
            )));
        }
        self.working.sequences.insert(key, sequence.clone());
        Ok(())
    }

    async fn update_sequence(&mut self, sequence: &DocumentTypeSequence) -> Result<(), StoreError> {
        let key = (sequence.tenant_id, sequence.doc_type_id);
        let row = self.working.sequences.get_mut(&key).ok_or_else(|| {
            StoreError::MissingRow(format!("sequence for document type {}", sequence.doc_type_id))
        })?;
        *row = sequence.clone();
        Ok(())
    }

    async fn lock_document(
        &mut self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Option<LedgerDocument>, StoreError> {
        Ok(self
            .working
            .documents
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn lines_of(&mut self, document_id: DocumentId) -> Result<Vec<LineEntry>, StoreError> {
        let mut lines = self
            .working
            .lines
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        lines.sort_by_key(|l| l.position);
        Ok(lines)
    }

    async fn documents_with_number(
        &mut self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        number: i64,
    ) -> Result<Vec<(DocumentId, DocumentStatus)>, StoreError> {
        Ok(self
            .working
            .documents
            .values()
            .filter(|d| {
                d.tenant_id == tenant_id
                    && d.doc_type_id == doc_type_id
                    && d.sequence_number == number
            })
            .map(|d| (d.id, d.status))
            .collect())
    }

    async fn insert_document(&mut self, document: &LedgerDocument) -> Result<(), StoreError> {
        if self.working.documents.contains_key(&document.id) {
            return Err(StoreError::UniqueViolation(format!(
                "document {} already exists",
                document.id
            )));
        }
        if self.working.number_taken(document) {
            return Err(StoreError::UniqueViolation(format!(
                "document number {} already taken",
                document.sequence_number
            )));
        }
        self.working.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn update_document(&mut self, document: &LedgerDocument) -> Result<(), StoreError> {
        if self.working.number_taken(document) {
            return Err(StoreError::UniqueViolation(format!(
                "document number {} already taken",
                document.sequence_number
            )));
        }
        let row = self
            .working
            .documents
            .get_mut(&document.id)
            .ok_or_else(|| StoreError::MissingRow(format!("document {}", document.id)))?;
        *row = document.clone();
        Ok(())
    }

    async fn replace_lines(
        &mut self,
        document_id: DocumentId,
        lines: &[LineEntry],
    ) -> Result<(), StoreError> {
        self.working.lines.insert(document_id, lines.to_vec());
        Ok(())
    }

    async fn delete_document(&mut self, document_id: DocumentId) -> Result<(), StoreError> {
        self.working.lines.remove(&document_id);
        self.working
            .documents
            .remove(&document_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::MissingRow(format!("document {document_id}")))
    }

    async fn insert_trashed(
        &mut self,
        document: &TrashedDocument,
        lines: &[TrashedLineEntry],
    ) -> Result<(), StoreError> {
        self.working.trashed_documents.push(document.clone());
        self.working.trashed_lines.extend_from_slice(lines);
        Ok(())
    }

    async fn append_operation_log(&mut self, entry: &OperationLog) -> Result<(), StoreError> {
        self.working.operation_logs.push(entry.clone());
        Ok(())
    }

    async fn lock_plan(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Option<QuotaPlanPeriod>, StoreError> {
        Ok(self.working.plan_for(tenant_id, period).cloned())
    }

    async fn lock_plan_by_id(&mut self, id: QuotaPlanId) -> Result<Option<QuotaPlanPeriod>, StoreError> {
        Ok(self.working.plans.get(&id).cloned())
    }

    async fn earliest_plan_period(
        &mut self,
        tenant_id: TenantId,
    ) -> Result<Option<YearMonth>, StoreError> {
        Ok(self
            .working
            .plans
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .map(QuotaPlanPeriod::period)
            .min())
    }

    async fn insert_plan(&mut self, plan: &QuotaPlanPeriod) -> Result<(), StoreError> {
        if self.working.plan_for(plan.tenant_id, plan.period()).is_some() {
            return Err(StoreError::UniqueViolation(format!(
                "plan for {} already exists",
                plan.period()
            )));
        }
        self.working.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn update_plan(&mut self, plan: &QuotaPlanPeriod) -> Result<(), StoreError> {
        let row = self
            .working
            .plans
            .get_mut(&plan.id)
            .ok_or_else(|| StoreError::MissingRow(format!("plan {}", plan.id)))?;
        *row = plan.clone();
        Ok(())
    }

    async fn lock_spendable_pools(
        &mut self,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<Vec<OverflowPool>, StoreError> {
        Ok(self.working.spendable_pools(tenant_id, today))
    }

    async fn lock_pool(&mut self, id: OverflowPoolId) -> Result<Option<OverflowPool>, StoreError> {
        Ok(self.working.pools.get(&id).cloned())
    }

    async fn lock_pools_by_origin(
        &mut self,
        tenant_id: TenantId,
        origin: YearMonth,
    ) -> Result<Vec<OverflowPool>, StoreError> {
        let mut pools: Vec<OverflowPool> = self
            .working
            .pools
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.origin() == origin)
            .cloned()
            .collect();
        pools.sort_by_key(|p| (p.created_at, p.id));
        Ok(pools)
    }

    async fn insert_pool(&mut self, pool: &OverflowPool) -> Result<(), StoreError> {
        self.working.pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn update_pool(&mut self, pool: &OverflowPool) -> Result<(), StoreError> {
        if pool.available < 0 || pool.available > pool.initial {
            return Err(StoreError::Backend(format!(
                "overflow pool {} available {} outside [0, {}]",
                pool.id, pool.available, pool.initial
            )));
        }
        let row = self
            .working
            .pools
            .get_mut(&pool.id)
            .ok_or_else(|| StoreError::MissingRow(format!("overflow pool {}", pool.id)))?;
        *row = pool.clone();
        Ok(())
    }

    async fn lock_top_ups(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Vec<TopUp>, StoreError> {
        Ok(self.working.top_ups_for(tenant_id, period))
    }

    async fn lock_top_up(&mut self, id: TopUpId) -> Result<Option<TopUp>, StoreError> {
        Ok(self.working.top_ups.get(&id).cloned())
    }

    async fn insert_top_up(&mut self, top_up: &TopUp) -> Result<(), StoreError> {
        self.working.top_ups.insert(top_up.id, top_up.clone());
        Ok(())
    }

    async fn update_top_up(&mut self, top_up: &TopUp) -> Result<(), StoreError> {
        let row = self
            .working
            .top_ups
            .get_mut(&top_up.id)
            .ok_or_else(|| StoreError::MissingRow(format!("top-up {}", top_up.id)))?;
        *row = top_up.clone();
        Ok(())
    }

    async fn append_consumption(&mut self, entry: &ConsumptionLedgerEntry) -> Result<(), StoreError> {
        self.working.consumption.push(entry.clone());
        Ok(())
    }

    async fn consumption_for_document(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Vec<ConsumptionLedgerEntry>, StoreError> {
        Ok(self
            .working
            .consumption
            .iter()
            .filter(|e| e.document_id == Some(document_id))
            .cloned()
            .collect())
    }

    async fn detach_consumption(&mut self, document_id: DocumentId) -> Result<u64, StoreError> {
        let mut detached = 0;
        for entry in &mut self.working.consumption {
            if entry.document_id == Some(document_id) {
                entry.document_id = None;
                detached += 1;
            }
        }
        Ok(detached)
    }

    async fn last_expiry_of(
        &mut self,
        top_up_id: TopUpId,
    ) -> Result<Option<ConsumptionLedgerEntry>, StoreError> {
        Ok(self
            .working
            .consumption
            .iter()
            .rev()
            .find(|e| {
                e.op == ConsumptionOp::Expire
                    && e.source == QuotaSource::TopUp
                    && e.source_id == top_up_id.into_inner()
            })
            .cloned())
    }
}
