//! Append-only guards on the audit tables.
//!
//! The consumption ledger and operation log are never rewritten. The only
//! permitted change is clearing `consumption_ledger.document_id` when the
//! document it pointed at is deleted.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(CONSUMPTION_GUARD_SQL).await?;
        db.execute_unprepared(OPERATION_LOG_GUARD_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(DROP_SQL).await?;
        Ok(())
    }
}

const CONSUMPTION_GUARD_SQL: &str = r"
-- ============================================================
-- FUNCTION: guard_consumption_ledger
-- Rows are immutable except for detaching a deleted document
-- ============================================================
CREATE OR REPLACE FUNCTION guard_consumption_ledger()
RETURNS TRIGGER AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        RAISE EXCEPTION 'consumption ledger rows cannot be deleted';
    END IF;

    IF NEW.document_id IS NOT NULL AND NEW.document_id IS DISTINCT FROM OLD.document_id THEN
        RAISE EXCEPTION 'consumption ledger rows can only be detached from their document';
    END IF;

    IF (NEW.id, NEW.tenant_id, NEW.op, NEW.source, NEW.source_id, NEW.amount,
        NEW.balance_before, NEW.balance_after, NEW.reversal_of,
        NEW.period_year, NEW.period_month, NEW.actor, NEW.created_at)
       IS DISTINCT FROM
       (OLD.id, OLD.tenant_id, OLD.op, OLD.source, OLD.source_id, OLD.amount,
        OLD.balance_before, OLD.balance_after, OLD.reversal_of,
        OLD.period_year, OLD.period_month, OLD.actor, OLD.created_at) THEN
        RAISE EXCEPTION 'consumption ledger rows are append-only';
    END IF;

    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER trg_guard_consumption_ledger
BEFORE UPDATE OR DELETE ON consumption_ledger
FOR EACH ROW
EXECUTE FUNCTION guard_consumption_ledger();
";

const OPERATION_LOG_GUARD_SQL: &str = r"
-- ============================================================
-- FUNCTION: guard_operation_logs
-- ============================================================
CREATE OR REPLACE FUNCTION guard_operation_logs()
RETURNS TRIGGER AS $$
BEGIN
    RAISE EXCEPTION 'operation log entries are append-only';
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER trg_guard_operation_logs
BEFORE UPDATE OR DELETE ON operation_logs
FOR EACH ROW
EXECUTE FUNCTION guard_operation_logs();
";

const DROP_SQL: &str = r"
DROP TRIGGER IF EXISTS trg_guard_operation_logs ON operation_logs;
DROP TRIGGER IF EXISTS trg_guard_consumption_ledger ON consumption_ledger;
DROP FUNCTION IF EXISTS guard_operation_logs();
DROP FUNCTION IF EXISTS guard_consumption_ledger();
";
