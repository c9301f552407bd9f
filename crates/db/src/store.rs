//! `PostgreSQL` implementation of the ledger storage ports.
//!
//! Every `lock_*` read is issued as `SELECT ... FOR UPDATE` inside the unit's
//! database transaction, so concurrent units touching the same rows queue behind
//! each other until commit or rollback. Month locks are transaction-scoped
//! advisory locks, since an open month has no row to lock.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tally_core::fiscal::{ClosedPeriod, YearMonth};
use tally_core::ledger::types::{
    DocumentStatus, DocumentTypeSequence, DocumentWithLines, LedgerDocument, LineEntry,
    OperationLog, TrashedDocument, TrashedLineEntry,
};
use tally_core::quota::{ConsumptionLedgerEntry, OverflowPool, QuotaPlanPeriod, TopUp};
use tally_core::store::{LedgerStore, LedgerTx, PeriodLock, QuotaSources, StoreError};
use tally_shared::types::{
    DocumentId, DocumentTypeId, OverflowPoolId, QuotaPlanId, TenantId, TopUpId,
};
use tracing::debug;
use uuid::Uuid;

use crate::convert::{
    closed_period_from_model, closed_period_to_active, consumption_from_model,
    consumption_to_active, document_from_model, document_status_from_db, document_to_active,
    line_from_model, line_to_active, operation_log_to_active, period_columns, period_from_db,
    period_lock_keys, plan_from_model, plan_to_active, pool_from_model, pool_to_active,
    sequence_from_model, sequence_values, store_err, top_up_from_model, top_up_to_active,
    trashed_line_to_active, trashed_to_active,
};
use crate::entities::{
    closed_periods, consumption_ledger, document_sequences, ledger_documents, line_entries,
    operation_logs, overflow_pools, quota_plans, sea_orm_active_enums as db, top_ups,
    trashed_documents, trashed_line_entries,
};

/// Ledger store backed by a `PostgreSQL` connection pool.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    db: DatabaseConnection,
}

impl PgLedgerStore {
    /// Wraps an open connection pool.
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let txn = self.db.begin().await.map_err(store_err)?;
        Ok(PgLedgerTx { txn })
    }

    async fn find_document(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Option<DocumentWithLines>, StoreError> {
        let Some(model) = ledger_documents::Entity::find_by_id(id.into_inner())
            .filter(ledger_documents::Column::TenantId.eq(tenant_id.into_inner()))
            .one(&self.db)
            .await
            .map_err(store_err)?
        else {
            return Ok(None);
        };

        let lines = line_entries::Entity::find()
            .filter(line_entries::Column::DocumentId.eq(id.into_inner()))
            .order_by_asc(line_entries::Column::Position)
            .all(&self.db)
            .await
            .map_err(store_err)?;

        Ok(Some(DocumentWithLines {
            document: document_from_model(model),
            lines: lines.into_iter().map(line_from_model).collect(),
        }))
    }

    async fn quota_sources(
        &self,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<QuotaSources, StoreError> {
        let period = YearMonth::from_date(today);
        let (year, month) = period_columns(period)?;

        let plan = quota_plans::Entity::find()
            .filter(quota_plans::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(quota_plans::Column::Year.eq(year))
            .filter(quota_plans::Column::Month.eq(month))
            .one(&self.db)
            .await
            .map_err(store_err)?
            .map(plan_from_model)
            .transpose()?;

        let pools = spendable_pools_query(tenant_id, today)
            .all(&self.db)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(pool_from_model)
            .collect::<Result<Vec<_>, _>>()?;

        let top_ups = top_ups_query(tenant_id, year, month)
            .all(&self.db)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(top_up_from_model)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QuotaSources {
            plan,
            pools,
            top_ups,
        })
    }
}

fn spendable_pools_query(tenant_id: TenantId, today: NaiveDate) -> sea_orm::Select<overflow_pools::Entity> {
    overflow_pools::Entity::find()
        .filter(overflow_pools::Column::TenantId.eq(tenant_id.into_inner()))
        .filter(overflow_pools::Column::State.eq(db::PoolState::Active))
        .filter(overflow_pools::Column::Available.gt(0))
        .filter(overflow_pools::Column::ExpiryDate.gte(today))
        .order_by_asc(overflow_pools::Column::OriginYear)
        .order_by_asc(overflow_pools::Column::OriginMonth)
        .order_by_asc(overflow_pools::Column::CreatedAt)
        .order_by_asc(overflow_pools::Column::Id)
}

fn top_ups_query(tenant_id: TenantId, year: i32, month: i32) -> sea_orm::Select<top_ups::Entity> {
    top_ups::Entity::find()
        .filter(top_ups::Column::TenantId.eq(tenant_id.into_inner()))
        .filter(top_ups::Column::Year.eq(year))
        .filter(top_ups::Column::Month.eq(month))
        .order_by_asc(top_ups::Column::PurchasedAt)
        .order_by_asc(top_ups::Column::Id)
}

/// A unit of work on [`PgLedgerStore`]. Dropping it rolls the transaction back.
#[derive(Debug)]
pub struct PgLedgerTx {
    txn: DatabaseTransaction,
}

impl PgLedgerTx {
    async fn find_sequence_row(
        &self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
    ) -> Result<Option<document_sequences::Model>, StoreError> {
        document_sequences::Entity::find()
            .filter(document_sequences::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(document_sequences::Column::DocTypeId.eq(doc_type_id.into_inner()))
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.txn.commit().await.map_err(store_err)?;
        debug!("Ledger transaction committed");
        Ok(())
    }

    // ---- closed periods ----

    async fn lock_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
        mode: PeriodLock,
    ) -> Result<(), StoreError> {
        let (tenant_key, month_key) = period_lock_keys(tenant_id, period)?;
        let function = match mode {
            PeriodLock::Shared => "pg_advisory_xact_lock_shared",
            PeriodLock::Exclusive => "pg_advisory_xact_lock",
        };
        self.txn
            .execute_unprepared(&format!("SELECT {function}({tenant_key}, {month_key})"))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn closed_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Option<ClosedPeriod>, StoreError> {
        let (year, month) = period_columns(period)?;
        closed_periods::Entity::find()
            .filter(closed_periods::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(closed_periods::Column::Year.eq(year))
            .filter(closed_periods::Column::Month.eq(month))
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(closed_period_from_model)
            .transpose()
    }

    async fn insert_closed_period(&mut self, row: &ClosedPeriod) -> Result<(), StoreError> {
        closed_periods::Entity::insert(closed_period_to_active(row)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_closed_period(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<(), StoreError> {
        let (year, month) = period_columns(period)?;
        closed_periods::Entity::delete_many()
            .filter(closed_periods::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(closed_periods::Column::Year.eq(year))
            .filter(closed_periods::Column::Month.eq(month))
            .exec(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- sequences ----

    async fn lock_sequence(
        &mut self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
    ) -> Result<Option<DocumentTypeSequence>, StoreError> {
        Ok(self
            .find_sequence_row(tenant_id, doc_type_id)
            .await?
            .map(sequence_from_model))
    }

    async fn insert_sequence(&mut self, sequence: &DocumentTypeSequence) -> Result<(), StoreError> {
        let (current_number, manual_numbering, inventory_effect, counterparty_ledger) =
            sequence_values(sequence);
        let row = document_sequences::ActiveModel {
            id: Set(Uuid::now_v7()),
            tenant_id: Set(sequence.tenant_id.into_inner()),
            doc_type_id: Set(sequence.doc_type_id.into_inner()),
            current_number: Set(current_number),
            manual_numbering: Set(manual_numbering),
            inventory_effect: Set(inventory_effect),
            counterparty_ledger: Set(counterparty_ledger),
            updated_at: Set(Utc::now().fixed_offset()),
        };
        let inserted = document_sequences::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    document_sequences::Column::TenantId,
                    document_sequences::Column::DocTypeId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        // ON CONFLICT keeps the transaction usable so the caller can lock the winner's row.
        if inserted == 0 {
            return Err(StoreError::UniqueViolation(format!(
                "sequence for document type {} already exists",
                sequence.doc_type_id
            )));
        }
        Ok(())
    }

    async fn update_sequence(&mut self, sequence: &DocumentTypeSequence) -> Result<(), StoreError> {
        let model = self
            .find_sequence_row(sequence.tenant_id, sequence.doc_type_id)
            .await?
            .ok_or_else(|| {
                StoreError::MissingRow(format!(
                    "sequence for document type {}",
                    sequence.doc_type_id
                ))
            })?;
        let (current_number, manual_numbering, inventory_effect, counterparty_ledger) =
            sequence_values(sequence);

        let mut row = model.into_active_model();
        row.current_number = Set(current_number);
        row.manual_numbering = Set(manual_numbering);
        row.inventory_effect = Set(inventory_effect);
        row.counterparty_ledger = Set(counterparty_ledger);
        row.updated_at = Set(Utc::now().fixed_offset());
        row.update(&self.txn).await.map_err(store_err)?;
        Ok(())
    }

    // ---- documents ----

    async fn lock_document(
        &mut self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Option<LedgerDocument>, StoreError> {
        Ok(ledger_documents::Entity::find_by_id(id.into_inner())
            .filter(ledger_documents::Column::TenantId.eq(tenant_id.into_inner()))
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(document_from_model))
    }

    async fn lines_of(&mut self, document_id: DocumentId) -> Result<Vec<LineEntry>, StoreError> {
        Ok(line_entries::Entity::find()
            .filter(line_entries::Column::DocumentId.eq(document_id.into_inner()))
            .order_by_asc(line_entries::Column::Position)
            .all(&self.txn)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(line_from_model)
            .collect())
    }

    async fn documents_with_number(
        &mut self,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        number: i64,
    ) -> Result<Vec<(DocumentId, DocumentStatus)>, StoreError> {
        Ok(ledger_documents::Entity::find()
            .filter(ledger_documents::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(ledger_documents::Column::DocTypeId.eq(doc_type_id.into_inner()))
            .filter(ledger_documents::Column::SequenceNumber.eq(number))
            .all(&self.txn)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|m| (DocumentId::from_uuid(m.id), document_status_from_db(m.status)))
            .collect())
    }

    async fn insert_document(&mut self, document: &LedgerDocument) -> Result<(), StoreError> {
        ledger_documents::Entity::insert(document_to_active(document))
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_document(&mut self, document: &LedgerDocument) -> Result<(), StoreError> {
        document_to_active(document)
            .update(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn replace_lines(
        &mut self,
        document_id: DocumentId,
        lines: &[LineEntry],
    ) -> Result<(), StoreError> {
        line_entries::Entity::delete_many()
            .filter(line_entries::Column::DocumentId.eq(document_id.into_inner()))
            .exec(&self.txn)
            .await
            .map_err(store_err)?;

        if lines.is_empty() {
            return Ok(());
        }
        line_entries::Entity::insert_many(lines.iter().map(line_to_active))
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_document(&mut self, document_id: DocumentId) -> Result<(), StoreError> {
        line_entries::Entity::delete_many()
            .filter(line_entries::Column::DocumentId.eq(document_id.into_inner()))
            .exec(&self.txn)
            .await
            .map_err(store_err)?;

        let deleted = ledger_documents::Entity::delete_by_id(document_id.into_inner())
            .exec(&self.txn)
            .await
            .map_err(store_err)?;
        if deleted.rows_affected == 0 {
            return Err(StoreError::MissingRow(format!("document {document_id}")));
        }
        Ok(())
    }

    async fn insert_trashed(
        &mut self,
        document: &TrashedDocument,
        lines: &[TrashedLineEntry],
    ) -> Result<(), StoreError> {
        trashed_documents::Entity::insert(trashed_to_active(document))
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;

        if !lines.is_empty() {
            trashed_line_entries::Entity::insert_many(lines.iter().map(trashed_line_to_active))
                .exec_without_returning(&self.txn)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn append_operation_log(&mut self, entry: &OperationLog) -> Result<(), StoreError> {
        operation_logs::Entity::insert(operation_log_to_active(entry))
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- quota plans ----

    async fn lock_plan(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Option<QuotaPlanPeriod>, StoreError> {
        let (year, month) = period_columns(period)?;
        quota_plans::Entity::find()
            .filter(quota_plans::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(quota_plans::Column::Year.eq(year))
            .filter(quota_plans::Column::Month.eq(month))
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(plan_from_model)
            .transpose()
    }

    async fn lock_plan_by_id(&mut self, id: QuotaPlanId) -> Result<Option<QuotaPlanPeriod>, StoreError> {
        quota_plans::Entity::find_by_id(id.into_inner())
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(plan_from_model)
            .transpose()
    }

    async fn earliest_plan_period(
        &mut self,
        tenant_id: TenantId,
    ) -> Result<Option<YearMonth>, StoreError> {
        quota_plans::Entity::find()
            .filter(quota_plans::Column::TenantId.eq(tenant_id.into_inner()))
            .order_by_asc(quota_plans::Column::Year)
            .order_by_asc(quota_plans::Column::Month)
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(|m| period_from_db(m.year, m.month))
            .transpose()
    }

    async fn insert_plan(&mut self, plan: &QuotaPlanPeriod) -> Result<(), StoreError> {
        quota_plans::Entity::insert(plan_to_active(plan)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_plan(&mut self, plan: &QuotaPlanPeriod) -> Result<(), StoreError> {
        plan_to_active(plan)?
            .update(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- overflow pools ----

    async fn lock_spendable_pools(
        &mut self,
        tenant_id: TenantId,
        today: NaiveDate,
    ) -> Result<Vec<OverflowPool>, StoreError> {
        spendable_pools_query(tenant_id, today)
            .lock_exclusive()
            .all(&self.txn)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(pool_from_model)
            .collect()
    }

    async fn lock_pool(&mut self, id: OverflowPoolId) -> Result<Option<OverflowPool>, StoreError> {
        overflow_pools::Entity::find_by_id(id.into_inner())
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(pool_from_model)
            .transpose()
    }

    async fn lock_pools_by_origin(
        &mut self,
        tenant_id: TenantId,
        origin: YearMonth,
    ) -> Result<Vec<OverflowPool>, StoreError> {
        let (year, month) = period_columns(origin)?;
        overflow_pools::Entity::find()
            .filter(overflow_pools::Column::TenantId.eq(tenant_id.into_inner()))
            .filter(overflow_pools::Column::OriginYear.eq(year))
            .filter(overflow_pools::Column::OriginMonth.eq(month))
            .order_by_asc(overflow_pools::Column::CreatedAt)
            .order_by_asc(overflow_pools::Column::Id)
            .lock_exclusive()
            .all(&self.txn)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(pool_from_model)
            .collect()
    }

    async fn insert_pool(&mut self, pool: &OverflowPool) -> Result<(), StoreError> {
        overflow_pools::Entity::insert(pool_to_active(pool)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_pool(&mut self, pool: &OverflowPool) -> Result<(), StoreError> {
        if pool.available < 0 || pool.available > pool.initial {
            return Err(StoreError::Backend(format!(
                "overflow pool {} available {} outside [0, {}]",
                pool.id, pool.available, pool.initial
            )));
        }
        pool_to_active(pool)?
            .update(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- top-ups ----

    async fn lock_top_ups(
        &mut self,
        tenant_id: TenantId,
        period: YearMonth,
    ) -> Result<Vec<TopUp>, StoreError> {
        let (year, month) = period_columns(period)?;
        top_ups_query(tenant_id, year, month)
            .lock_exclusive()
            .all(&self.txn)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(top_up_from_model)
            .collect()
    }

    async fn lock_top_up(&mut self, id: TopUpId) -> Result<Option<TopUp>, StoreError> {
        top_ups::Entity::find_by_id(id.into_inner())
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(top_up_from_model)
            .transpose()
    }

    async fn insert_top_up(&mut self, top_up: &TopUp) -> Result<(), StoreError> {
        top_ups::Entity::insert(top_up_to_active(top_up)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_top_up(&mut self, top_up: &TopUp) -> Result<(), StoreError> {
        top_up_to_active(top_up)?
            .update(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    // ---- consumption ledger ----

    async fn append_consumption(&mut self, entry: &ConsumptionLedgerEntry) -> Result<(), StoreError> {
        consumption_ledger::Entity::insert(consumption_to_active(entry)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn consumption_for_document(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Vec<ConsumptionLedgerEntry>, StoreError> {
        consumption_ledger::Entity::find()
            .filter(consumption_ledger::Column::DocumentId.eq(document_id.into_inner()))
            .order_by_asc(consumption_ledger::Column::CreatedAt)
            .order_by_asc(consumption_ledger::Column::Id)
            .all(&self.txn)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(consumption_from_model)
            .collect()
    }

    async fn detach_consumption(&mut self, document_id: DocumentId) -> Result<u64, StoreError> {
        let result = consumption_ledger::Entity::update_many()
            .col_expr(
                consumption_ledger::Column::DocumentId,
                Expr::value(Option::<Uuid>::None),
            )
            .filter(consumption_ledger::Column::DocumentId.eq(document_id.into_inner()))
            .exec(&self.txn)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected)
    }

    async fn last_expiry_of(
        &mut self,
        top_up_id: TopUpId,
    ) -> Result<Option<ConsumptionLedgerEntry>, StoreError> {
        consumption_ledger::Entity::find()
            .filter(consumption_ledger::Column::Op.eq(db::ConsumptionOp::Expire))
            .filter(consumption_ledger::Column::Source.eq(db::QuotaSource::TopUp))
            .filter(consumption_ledger::Column::SourceId.eq(top_up_id.into_inner()))
            .order_by_desc(consumption_ledger::Column::CreatedAt)
            .order_by_desc(consumption_ledger::Column::Id)
            .one(&self.txn)
            .await
            .map_err(store_err)?
            .map(consumption_from_model)
            .transpose()
    }
}
