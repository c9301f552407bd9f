//! Mapping between entity models and ledger domain types.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{DbErr, Set, SqlErr};
use tally_core::fiscal::{ClosedPeriod, YearMonth};
use tally_core::ledger::types::{
    CounterpartyLedger, DocumentStatus, DocumentTypeSequence, LedgerDocument, LineEntry,
    MovementKind, OperationKind, OperationLog, TrashedDocument, TrashedLineEntry,
};
use tally_core::quota::{
    ConsumptionLedgerEntry, ConsumptionOp, OverflowPool, PlanState, PoolState, QuotaPlanPeriod,
    QuotaSource, TopUp, TopUpState,
};
use tally_core::store::StoreError;
use tally_shared::types::{
    AccountId, ConsumptionEntryId, CostCenterId, CounterpartyId, DocumentId, DocumentTypeId,
    LineEntryId, OperationLogId, OverflowPoolId, ProductId, QuotaPlanId, TenantId, TopUpId,
    UserId, WarehouseId,
};

use crate::entities::{
    closed_periods, consumption_ledger, document_sequences, ledger_documents, line_entries,
    operation_logs, overflow_pools, quota_plans, sea_orm_active_enums as db, top_ups,
    trashed_documents, trashed_line_entries,
};

/// Maps a database error, keeping uniqueness violations distinguishable.
pub(crate) fn store_err(err: DbErr) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => StoreError::UniqueViolation(detail),
        _ => match err {
            DbErr::RecordNotFound(detail) => StoreError::MissingRow(detail),
            DbErr::RecordNotUpdated => StoreError::MissingRow("no row updated".to_string()),
            other => StoreError::Backend(other.to_string()),
        },
    }
}

fn ts(at: DateTime<Utc>) -> DateTime<FixedOffset> {
    at.fixed_offset()
}

fn utc(at: DateTime<FixedOffset>) -> DateTime<Utc> {
    at.with_timezone(&Utc)
}

fn month_to_db(month: u32) -> Result<i32, StoreError> {
    i32::try_from(month).map_err(|_| StoreError::Corrupt(format!("month {month} out of range")))
}

pub(crate) fn month_from_db(month: i32) -> Result<u32, StoreError> {
    u32::try_from(month)
        .ok()
        .filter(|m| (1..=12).contains(m))
        .ok_or_else(|| StoreError::Corrupt(format!("month {month} out of range")))
}

pub(crate) fn period_from_db(year: i32, month: i32) -> Result<YearMonth, StoreError> {
    let month = month_from_db(month)?;
    YearMonth::new(year, month)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid period {year}-{month}")))
}

pub(crate) fn period_columns(period: YearMonth) -> Result<(i32, i32), StoreError> {
    Ok((period.year, month_to_db(period.month)?))
}

/// Advisory lock keys of a tenant month: the tenant id folded to 32 bits and the
/// month counted from year zero.
pub(crate) fn period_lock_keys(
    tenant_id: TenantId,
    period: YearMonth,
) -> Result<(i32, i32), StoreError> {
    let tenant_key = tenant_id
        .into_inner()
        .as_bytes()
        .chunks_exact(4)
        .fold(0_i32, |acc, chunk| {
            acc ^ i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        });
    let (year, month) = period_columns(period)?;
    let month_key = year
        .checked_mul(12)
        .and_then(|months| months.checked_add(month - 1))
        .ok_or_else(|| StoreError::Corrupt(format!("month {period} has no lock key")))?;
    Ok((tenant_key, month_key))
}

// ============================================================================
// Enums
// ============================================================================

fn status_to_db(status: DocumentStatus) -> db::DocumentStatus {
    match status {
        DocumentStatus::Active => db::DocumentStatus::Active,
        DocumentStatus::Voided => db::DocumentStatus::Voided,
    }
}

fn status_from_db(status: db::DocumentStatus) -> DocumentStatus {
    match status {
        db::DocumentStatus::Active => DocumentStatus::Active,
        db::DocumentStatus::Voided => DocumentStatus::Voided,
    }
}

pub(crate) fn document_status_from_db(status: db::DocumentStatus) -> DocumentStatus {
    status_from_db(status)
}

fn movement_to_db(kind: MovementKind) -> db::MovementKind {
    match kind {
        MovementKind::In => db::MovementKind::In,
        MovementKind::Out => db::MovementKind::Out,
    }
}

fn movement_from_db(kind: db::MovementKind) -> MovementKind {
    match kind {
        db::MovementKind::In => MovementKind::In,
        db::MovementKind::Out => MovementKind::Out,
    }
}

fn counterparty_to_db(ledger: CounterpartyLedger) -> db::CounterpartyLedger {
    match ledger {
        CounterpartyLedger::Receivable => db::CounterpartyLedger::Receivable,
        CounterpartyLedger::Payable => db::CounterpartyLedger::Payable,
    }
}

fn counterparty_from_db(ledger: db::CounterpartyLedger) -> CounterpartyLedger {
    match ledger {
        db::CounterpartyLedger::Receivable => CounterpartyLedger::Receivable,
        db::CounterpartyLedger::Payable => CounterpartyLedger::Payable,
    }
}

fn operation_to_db(kind: OperationKind) -> db::OperationKind {
    match kind {
        OperationKind::Void => db::OperationKind::Void,
        OperationKind::Delete => db::OperationKind::Delete,
        OperationKind::Modify => db::OperationKind::Modify,
        OperationKind::Reactivate => db::OperationKind::Reactivate,
    }
}

fn plan_state_to_db(state: PlanState) -> db::PlanState {
    match state {
        PlanState::Open => db::PlanState::Open,
        PlanState::Closed => db::PlanState::Closed,
    }
}

fn plan_state_from_db(state: db::PlanState) -> PlanState {
    match state {
        db::PlanState::Open => PlanState::Open,
        db::PlanState::Closed => PlanState::Closed,
    }
}

fn pool_state_to_db(state: PoolState) -> db::PoolState {
    match state {
        PoolState::Active => db::PoolState::Active,
        PoolState::Exhausted => db::PoolState::Exhausted,
        PoolState::Voided => db::PoolState::Voided,
    }
}

fn pool_state_from_db(state: db::PoolState) -> PoolState {
    match state {
        db::PoolState::Active => PoolState::Active,
        db::PoolState::Exhausted => PoolState::Exhausted,
        db::PoolState::Voided => PoolState::Voided,
    }
}

fn top_up_state_to_db(state: TopUpState) -> db::TopUpState {
    match state {
        TopUpState::Active => db::TopUpState::Active,
        TopUpState::Expired => db::TopUpState::Expired,
    }
}

fn top_up_state_from_db(state: db::TopUpState) -> TopUpState {
    match state {
        db::TopUpState::Active => TopUpState::Active,
        db::TopUpState::Expired => TopUpState::Expired,
    }
}

fn op_to_db(op: ConsumptionOp) -> db::ConsumptionOp {
    match op {
        ConsumptionOp::Consume => db::ConsumptionOp::Consume,
        ConsumptionOp::Reverse => db::ConsumptionOp::Reverse,
        ConsumptionOp::Close => db::ConsumptionOp::Close,
        ConsumptionOp::Expire => db::ConsumptionOp::Expire,
        ConsumptionOp::Reopen => db::ConsumptionOp::Reopen,
    }
}

fn op_from_db(op: db::ConsumptionOp) -> ConsumptionOp {
    match op {
        db::ConsumptionOp::Consume => ConsumptionOp::Consume,
        db::ConsumptionOp::Reverse => ConsumptionOp::Reverse,
        db::ConsumptionOp::Close => ConsumptionOp::Close,
        db::ConsumptionOp::Expire => ConsumptionOp::Expire,
        db::ConsumptionOp::Reopen => ConsumptionOp::Reopen,
    }
}

fn source_to_db(source: QuotaSource) -> db::QuotaSource {
    match source {
        QuotaSource::Plan => db::QuotaSource::Plan,
        QuotaSource::Overflow => db::QuotaSource::Overflow,
        QuotaSource::TopUp => db::QuotaSource::TopUp,
    }
}

fn source_from_db(source: db::QuotaSource) -> QuotaSource {
    match source {
        db::QuotaSource::Plan => QuotaSource::Plan,
        db::QuotaSource::Overflow => QuotaSource::Overflow,
        db::QuotaSource::TopUp => QuotaSource::TopUp,
    }
}

// ============================================================================
// Closed periods
// ============================================================================

pub(crate) fn closed_period_from_model(m: closed_periods::Model) -> Result<ClosedPeriod, StoreError> {
    Ok(ClosedPeriod {
        tenant_id: TenantId::from_uuid(m.tenant_id),
        year: m.year,
        month: month_from_db(m.month)?,
        closed_by: m.closed_by.map(UserId::from_uuid),
        closed_at: utc(m.closed_at),
    })
}

pub(crate) fn closed_period_to_active(
    row: &ClosedPeriod,
) -> Result<closed_periods::ActiveModel, StoreError> {
    Ok(closed_periods::ActiveModel {
        id: Set(uuid::Uuid::now_v7()),
        tenant_id: Set(row.tenant_id.into_inner()),
        year: Set(row.year),
        month: Set(month_to_db(row.month)?),
        closed_by: Set(row.closed_by.map(UserId::into_inner)),
        closed_at: Set(ts(row.closed_at)),
    })
}

// ============================================================================
// Sequences
// ============================================================================

pub(crate) fn sequence_from_model(m: document_sequences::Model) -> DocumentTypeSequence {
    DocumentTypeSequence {
        tenant_id: TenantId::from_uuid(m.tenant_id),
        doc_type_id: DocumentTypeId::from_uuid(m.doc_type_id),
        current_number: m.current_number,
        manual_numbering: m.manual_numbering,
        inventory_effect: m.inventory_effect.map(movement_from_db),
        counterparty_ledger: m.counterparty_ledger.map(counterparty_from_db),
    }
}

/// Sequence columns other than the surrogate key.
pub(crate) fn sequence_values(
    sequence: &DocumentTypeSequence,
) -> (
    i64,
    bool,
    Option<db::MovementKind>,
    Option<db::CounterpartyLedger>,
) {
    (
        sequence.current_number,
        sequence.manual_numbering,
        sequence.inventory_effect.map(movement_to_db),
        sequence.counterparty_ledger.map(counterparty_to_db),
    )
}

// ============================================================================
// Documents and lines
// ============================================================================

pub(crate) fn document_from_model(m: ledger_documents::Model) -> LedgerDocument {
    LedgerDocument {
        id: DocumentId::from_uuid(m.id),
        tenant_id: TenantId::from_uuid(m.tenant_id),
        doc_type_id: DocumentTypeId::from_uuid(m.doc_type_id),
        sequence_number: m.sequence_number,
        date: m.date,
        due_date: m.due_date,
        counterparty_id: m.counterparty_id.map(CounterpartyId::from_uuid),
        cost_center_id: m.cost_center_id.map(CostCenterId::from_uuid),
        warehouse_id: m.warehouse_id.map(WarehouseId::from_uuid),
        description: m.description,
        status: status_from_db(m.status),
        created_by: UserId::from_uuid(m.created_by),
        created_at: utc(m.created_at),
        updated_at: utc(m.updated_at),
        voided_at: m.voided_at.map(utc),
        voided_by: m.voided_by.map(UserId::from_uuid),
        void_reason: m.void_reason,
    }
}

pub(crate) fn document_to_active(d: &LedgerDocument) -> ledger_documents::ActiveModel {
    ledger_documents::ActiveModel {
        id: Set(d.id.into_inner()),
        tenant_id: Set(d.tenant_id.into_inner()),
        doc_type_id: Set(d.doc_type_id.into_inner()),
        sequence_number: Set(d.sequence_number),
        date: Set(d.date),
        due_date: Set(d.due_date),
        counterparty_id: Set(d.counterparty_id.map(CounterpartyId::into_inner)),
        cost_center_id: Set(d.cost_center_id.map(CostCenterId::into_inner)),
        warehouse_id: Set(d.warehouse_id.map(WarehouseId::into_inner)),
        description: Set(d.description.clone()),
        status: Set(status_to_db(d.status)),
        created_by: Set(d.created_by.into_inner()),
        created_at: Set(ts(d.created_at)),
        updated_at: Set(ts(d.updated_at)),
        voided_at: Set(d.voided_at.map(ts)),
        voided_by: Set(d.voided_by.map(UserId::into_inner)),
        void_reason: Set(d.void_reason.clone()),
    }
}

pub(crate) fn line_from_model(m: line_entries::Model) -> LineEntry {
    LineEntry {
        id: LineEntryId::from_uuid(m.id),
        document_id: DocumentId::from_uuid(m.document_id),
        position: m.position,
        account_id: AccountId::from_uuid(m.account_id),
        debit: m.debit,
        credit: m.credit,
        cost_center_id: m.cost_center_id.map(CostCenterId::from_uuid),
        concept: m.concept,
        product_id: m.product_id.map(ProductId::from_uuid),
        quantity: m.quantity,
        unit_cost: m.unit_cost,
    }
}

pub(crate) fn line_to_active(l: &LineEntry) -> line_entries::ActiveModel {
    line_entries::ActiveModel {
        id: Set(l.id.into_inner()),
        document_id: Set(l.document_id.into_inner()),
        position: Set(l.position),
        account_id: Set(l.account_id.into_inner()),
        debit: Set(l.debit),
        credit: Set(l.credit),
        cost_center_id: Set(l.cost_center_id.map(CostCenterId::into_inner)),
        concept: Set(l.concept.clone()),
        product_id: Set(l.product_id.map(ProductId::into_inner)),
        quantity: Set(l.quantity),
        unit_cost: Set(l.unit_cost),
    }
}

pub(crate) fn trashed_to_active(t: &TrashedDocument) -> trashed_documents::ActiveModel {
    let d = &t.original;
    trashed_documents::ActiveModel {
        id: Set(d.id.into_inner()),
        tenant_id: Set(d.tenant_id.into_inner()),
        doc_type_id: Set(d.doc_type_id.into_inner()),
        sequence_number: Set(d.sequence_number),
        date: Set(d.date),
        due_date: Set(d.due_date),
        counterparty_id: Set(d.counterparty_id.map(CounterpartyId::into_inner)),
        cost_center_id: Set(d.cost_center_id.map(CostCenterId::into_inner)),
        warehouse_id: Set(d.warehouse_id.map(WarehouseId::into_inner)),
        description: Set(d.description.clone()),
        status: Set(status_to_db(d.status)),
        created_by: Set(d.created_by.into_inner()),
        created_at: Set(ts(d.created_at)),
        updated_at: Set(ts(d.updated_at)),
        voided_at: Set(d.voided_at.map(ts)),
        voided_by: Set(d.voided_by.map(UserId::into_inner)),
        void_reason: Set(d.void_reason.clone()),
        deletion_reason: Set(t.deletion_reason.clone()),
        deleted_by: Set(t.deleted_by.into_inner()),
        deleted_at: Set(ts(t.deleted_at)),
    }
}

pub(crate) fn trashed_line_to_active(t: &TrashedLineEntry) -> trashed_line_entries::ActiveModel {
    let l = &t.original;
    trashed_line_entries::ActiveModel {
        id: Set(l.id.into_inner()),
        document_id: Set(l.document_id.into_inner()),
        position: Set(l.position),
        account_id: Set(l.account_id.into_inner()),
        debit: Set(l.debit),
        credit: Set(l.credit),
        cost_center_id: Set(l.cost_center_id.map(CostCenterId::into_inner)),
        concept: Set(l.concept.clone()),
        product_id: Set(l.product_id.map(ProductId::into_inner)),
        quantity: Set(l.quantity),
        unit_cost: Set(l.unit_cost),
        deleted_at: Set(ts(t.deleted_at)),
    }
}

pub(crate) fn operation_log_to_active(o: &OperationLog) -> operation_logs::ActiveModel {
    operation_logs::ActiveModel {
        id: Set(o.id.into_inner()),
        tenant_id: Set(o.tenant_id.into_inner()),
        document_id: Set(o.document_id.into_inner()),
        kind: Set(operation_to_db(o.kind)),
        reason: Set(o.reason.clone()),
        actor: Set(o.actor.into_inner()),
        snapshot: Set(o.snapshot.clone()),
        created_at: Set(ts(o.created_at)),
    }
}

// ============================================================================
// Quota
// ============================================================================

pub(crate) fn plan_from_model(m: quota_plans::Model) -> Result<QuotaPlanPeriod, StoreError> {
    Ok(QuotaPlanPeriod {
        id: QuotaPlanId::from_uuid(m.id),
        tenant_id: TenantId::from_uuid(m.tenant_id),
        year: m.year,
        month: month_from_db(m.month)?,
        allocated: m.allocated,
        available: m.available,
        state: plan_state_from_db(m.state),
        created_at: utc(m.created_at),
    })
}

pub(crate) fn plan_to_active(p: &QuotaPlanPeriod) -> Result<quota_plans::ActiveModel, StoreError> {
    Ok(quota_plans::ActiveModel {
        id: Set(p.id.into_inner()),
        tenant_id: Set(p.tenant_id.into_inner()),
        year: Set(p.year),
        month: Set(month_to_db(p.month)?),
        allocated: Set(p.allocated),
        available: Set(p.available),
        state: Set(plan_state_to_db(p.state)),
        created_at: Set(ts(p.created_at)),
    })
}

pub(crate) fn pool_from_model(m: overflow_pools::Model) -> Result<OverflowPool, StoreError> {
    Ok(OverflowPool {
        id: OverflowPoolId::from_uuid(m.id),
        tenant_id: TenantId::from_uuid(m.tenant_id),
        origin_year: m.origin_year,
        origin_month: month_from_db(m.origin_month)?,
        initial: m.initial,
        available: m.available,
        expiry_date: m.expiry_date,
        state: pool_state_from_db(m.state),
        created_at: utc(m.created_at),
    })
}

pub(crate) fn pool_to_active(p: &OverflowPool) -> Result<overflow_pools::ActiveModel, StoreError> {
    Ok(overflow_pools::ActiveModel {
        id: Set(p.id.into_inner()),
        tenant_id: Set(p.tenant_id.into_inner()),
        origin_year: Set(p.origin_year),
        origin_month: Set(month_to_db(p.origin_month)?),
        initial: Set(p.initial),
        available: Set(p.available),
        expiry_date: Set(p.expiry_date),
        state: Set(pool_state_to_db(p.state)),
        created_at: Set(ts(p.created_at)),
    })
}

pub(crate) fn top_up_from_model(m: top_ups::Model) -> Result<TopUp, StoreError> {
    Ok(TopUp {
        id: TopUpId::from_uuid(m.id),
        tenant_id: TenantId::from_uuid(m.tenant_id),
        year: m.year,
        month: month_from_db(m.month)?,
        purchased: m.purchased,
        available: m.available,
        state: top_up_state_from_db(m.state),
        purchased_at: utc(m.purchased_at),
    })
}

pub(crate) fn top_up_to_active(t: &TopUp) -> Result<top_ups::ActiveModel, StoreError> {
    Ok(top_ups::ActiveModel {
        id: Set(t.id.into_inner()),
        tenant_id: Set(t.tenant_id.into_inner()),
        year: Set(t.year),
        month: Set(month_to_db(t.month)?),
        purchased: Set(t.purchased),
        available: Set(t.available),
        state: Set(top_up_state_to_db(t.state)),
        purchased_at: Set(ts(t.purchased_at)),
    })
}

pub(crate) fn consumption_from_model(
    m: consumption_ledger::Model,
) -> Result<ConsumptionLedgerEntry, StoreError> {
    let period = match (m.period_year, m.period_month) {
        (Some(year), Some(month)) => Some(period_from_db(year, month)?),
        _ => None,
    };
    Ok(ConsumptionLedgerEntry {
        id: ConsumptionEntryId::from_uuid(m.id),
        tenant_id: TenantId::from_uuid(m.tenant_id),
        op: op_from_db(m.op),
        source: source_from_db(m.source),
        source_id: m.source_id,
        amount: m.amount,
        balance_before: m.balance_before,
        balance_after: m.balance_after,
        document_id: m.document_id.map(DocumentId::from_uuid),
        reversal_of: m.reversal_of.map(ConsumptionEntryId::from_uuid),
        period,
        actor: m.actor.map(UserId::from_uuid),
        created_at: utc(m.created_at),
    })
}

pub(crate) fn consumption_to_active(
    e: &ConsumptionLedgerEntry,
) -> Result<consumption_ledger::ActiveModel, StoreError> {
    let (period_year, period_month) = match e.period {
        Some(period) => {
            let (year, month) = period_columns(period)?;
            (Some(year), Some(month))
        }
        None => (None, None),
    };
    Ok(consumption_ledger::ActiveModel {
        id: Set(e.id.into_inner()),
        tenant_id: Set(e.tenant_id.into_inner()),
        op: Set(op_to_db(e.op)),
        source: Set(source_to_db(e.source)),
        source_id: Set(e.source_id),
        amount: Set(e.amount),
        balance_before: Set(e.balance_before),
        balance_after: Set(e.balance_after),
        document_id: Set(e.document_id.map(DocumentId::into_inner)),
        reversal_of: Set(e.reversal_of.map(ConsumptionEntryId::into_inner)),
        period_year: Set(period_year),
        period_month: Set(period_month),
        actor: Set(e.actor.map(UserId::into_inner)),
        created_at: Set(ts(e.created_at)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_bounds_checked() {
        assert_eq!(month_from_db(12).unwrap(), 12);
        assert!(matches!(month_from_db(0), Err(StoreError::Corrupt(_))));
        assert!(matches!(month_from_db(13), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_unique_violation_is_recognised() {
        let err = store_err(DbErr::RecordNotUpdated);
        assert!(matches!(err, StoreError::MissingRow(_)));

        let err = store_err(DbErr::Custom("boom".to_string()));
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn test_period_lock_keys() {
        let first = TenantId::from_uuid(uuid::Uuid::from_u128(1 << 96));
        let second = TenantId::from_uuid(uuid::Uuid::from_u128(2));
        let jan = YearMonth::new(2025, 1).unwrap();

        assert_eq!(period_lock_keys(first, jan).unwrap(), (1, 24_300));
        assert_eq!(period_lock_keys(second, jan).unwrap(), (2, 24_300));
        assert_eq!(
            period_lock_keys(first, YearMonth::new(2024, 12).unwrap()).unwrap(),
            (1, 24_299)
        );
        assert_eq!(
            period_lock_keys(first, YearMonth::new(2025, 2).unwrap()).unwrap(),
            (1, 24_301)
        );
    }

    #[test]
    fn test_timestamps_keep_the_instant() {
        let now = Utc::now();
        assert_eq!(utc(ts(now)), now);
    }
}
