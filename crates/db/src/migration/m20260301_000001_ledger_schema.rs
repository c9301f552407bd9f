//! Ledger schema: documents, numbering, period locks and the quota tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        // ============================================================
        // PART 1: ENUMS
        // ============================================================
        db.execute_unprepared(ENUMS_SQL).await?;

        // ============================================================
        // PART 2: PERIOD LOCKS & NUMBERING
        // ============================================================
        db.execute_unprepared(CLOSED_PERIODS_SQL).await?;
        db.execute_unprepared(DOCUMENT_SEQUENCES_SQL).await?;

        // ============================================================
        // PART 3: DOCUMENTS
        // ============================================================
        db.execute_unprepared(LEDGER_DOCUMENTS_SQL).await?;
        db.execute_unprepared(LINE_ENTRIES_SQL).await?;
        db.execute_unprepared(TRASH_SQL).await?;
        db.execute_unprepared(OPERATION_LOGS_SQL).await?;

        // ============================================================
        // PART 4: QUOTA
        // ============================================================
        db.execute_unprepared(QUOTA_PLANS_SQL).await?;
        db.execute_unprepared(OVERFLOW_POOLS_SQL).await?;
        db.execute_unprepared(TOP_UPS_SQL).await?;
        db.execute_unprepared(CONSUMPTION_LEDGER_SQL).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(DROP_ALL_SQL).await?;
        Ok(())
    }
}

// ============================================================
// SQL CONSTANTS
// ============================================================

const ENUMS_SQL: &str = r"
CREATE TYPE document_status AS ENUM ('active', 'voided');

CREATE TYPE movement_kind AS ENUM ('in', 'out');

CREATE TYPE counterparty_ledger AS ENUM ('receivable', 'payable');

CREATE TYPE operation_kind AS ENUM ('void', 'delete', 'modify', 'reactivate');

CREATE TYPE plan_state AS ENUM ('open', 'closed');

CREATE TYPE pool_state AS ENUM ('active', 'exhausted', 'voided');

CREATE TYPE top_up_state AS ENUM ('active', 'expired');

CREATE TYPE consumption_op AS ENUM ('consume', 'reverse', 'close', 'expire', 'reopen');

CREATE TYPE quota_source AS ENUM ('plan', 'overflow', 'top_up');
";

const CLOSED_PERIODS_SQL: &str = r"
CREATE TABLE closed_periods (
    id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    tenant_id       UUID NOT NULL,
    year            INTEGER NOT NULL,
    month           INTEGER NOT NULL,
    closed_by       UUID,
    closed_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT uq_closed_periods_month UNIQUE (tenant_id, year, month),
    CONSTRAINT chk_closed_periods_month CHECK (month BETWEEN 1 AND 12)
);
";

const DOCUMENT_SEQUENCES_SQL: &str = r"
CREATE TABLE document_sequences (
    id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    tenant_id           UUID NOT NULL,
    doc_type_id         UUID NOT NULL,
    current_number      BIGINT NOT NULL DEFAULT 0,
    manual_numbering    BOOLEAN NOT NULL DEFAULT false,
    inventory_effect    movement_kind,
    counterparty_ledger counterparty_ledger,
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT uq_document_sequences_type UNIQUE (tenant_id, doc_type_id),
    CONSTRAINT chk_document_sequences_current CHECK (current_number >= 0)
);
";

const LEDGER_DOCUMENTS_SQL: &str = r"
CREATE TABLE ledger_documents (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    doc_type_id     UUID NOT NULL,
    sequence_number BIGINT NOT NULL,
    date            DATE NOT NULL,
    due_date        DATE,
    counterparty_id UUID,
    cost_center_id  UUID,
    warehouse_id    UUID,
    description     TEXT,
    status          document_status NOT NULL DEFAULT 'active',
    created_by      UUID NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    voided_at       TIMESTAMPTZ,
    voided_by       UUID,
    void_reason     TEXT,

    CONSTRAINT chk_ledger_documents_number CHECK (sequence_number > 0),
    CONSTRAINT chk_ledger_documents_due_date CHECK (due_date IS NULL OR due_date >= date),
    CONSTRAINT chk_ledger_documents_void CHECK (
        (status = 'voided' AND voided_at IS NOT NULL)
        OR (status = 'active' AND voided_at IS NULL)
    )
);

-- Numbers are unique among ACTIVE documents only; a voided document keeps its
-- number but does not block it.
CREATE UNIQUE INDEX uq_ledger_documents_active_number
    ON ledger_documents(tenant_id, doc_type_id, sequence_number)
    WHERE status = 'active';

CREATE INDEX idx_ledger_documents_number
    ON ledger_documents(tenant_id, doc_type_id, sequence_number);
CREATE INDEX idx_ledger_documents_date ON ledger_documents(tenant_id, date);
CREATE INDEX idx_ledger_documents_counterparty
    ON ledger_documents(tenant_id, counterparty_id)
    WHERE counterparty_id IS NOT NULL;
";

const LINE_ENTRIES_SQL: &str = r"
CREATE TABLE line_entries (
    id              UUID PRIMARY KEY,
    document_id     UUID NOT NULL REFERENCES ledger_documents(id) ON DELETE CASCADE,
    position        INTEGER NOT NULL,
    account_id      UUID NOT NULL,
    debit           NUMERIC(19, 4) NOT NULL DEFAULT 0,
    credit          NUMERIC(19, 4) NOT NULL DEFAULT 0,
    cost_center_id  UUID,
    concept         TEXT NOT NULL DEFAULT '',
    product_id      UUID,
    quantity        NUMERIC(19, 4),
    unit_cost       NUMERIC(19, 4),

    CONSTRAINT uq_line_entries_position UNIQUE (document_id, position),
    CONSTRAINT chk_line_entries_non_negative CHECK (debit >= 0 AND credit >= 0),
    CONSTRAINT chk_line_entries_one_side CHECK (debit = 0 OR credit = 0),
    CONSTRAINT chk_line_entries_quantity CHECK (
        quantity IS NULL OR (quantity > 0 AND product_id IS NOT NULL)
    )
);

CREATE INDEX idx_line_entries_account ON line_entries(account_id);
";

const TRASH_SQL: &str = r"
CREATE TABLE trashed_documents (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    doc_type_id     UUID NOT NULL,
    sequence_number BIGINT NOT NULL,
    date            DATE NOT NULL,
    due_date        DATE,
    counterparty_id UUID,
    cost_center_id  UUID,
    warehouse_id    UUID,
    description     TEXT,
    status          document_status NOT NULL,
    created_by      UUID NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    voided_at       TIMESTAMPTZ,
    voided_by       UUID,
    void_reason     TEXT,
    deletion_reason TEXT NOT NULL,
    deleted_by      UUID NOT NULL,
    deleted_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX idx_trashed_documents_tenant ON trashed_documents(tenant_id, deleted_at DESC);

CREATE TABLE trashed_line_entries (
    id              UUID PRIMARY KEY,
    document_id     UUID NOT NULL REFERENCES trashed_documents(id) ON DELETE CASCADE,
    position        INTEGER NOT NULL,
    account_id      UUID NOT NULL,
    debit           NUMERIC(19, 4) NOT NULL,
    credit          NUMERIC(19, 4) NOT NULL,
    cost_center_id  UUID,
    concept         TEXT NOT NULL,
    product_id      UUID,
    quantity        NUMERIC(19, 4),
    unit_cost       NUMERIC(19, 4),
    deleted_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX idx_trashed_line_entries_document ON trashed_line_entries(document_id);
";

const OPERATION_LOGS_SQL: &str = r"
CREATE TABLE operation_logs (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    document_id     UUID NOT NULL,
    kind            operation_kind NOT NULL,
    reason          TEXT,
    actor           UUID NOT NULL,
    snapshot        JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX idx_operation_logs_document ON operation_logs(document_id, created_at);
";

const QUOTA_PLANS_SQL: &str = r"
CREATE TABLE quota_plans (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    year            INTEGER NOT NULL,
    month           INTEGER NOT NULL,
    allocated       BIGINT NOT NULL,
    available       BIGINT NOT NULL,
    state           plan_state NOT NULL DEFAULT 'open',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT uq_quota_plans_month UNIQUE (tenant_id, year, month),
    CONSTRAINT chk_quota_plans_month CHECK (month BETWEEN 1 AND 12),
    CONSTRAINT chk_quota_plans_allocated CHECK (allocated >= 0),
    CONSTRAINT chk_quota_plans_available CHECK (available >= 0)
);
";

const OVERFLOW_POOLS_SQL: &str = r"
CREATE TABLE overflow_pools (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    origin_year     INTEGER NOT NULL,
    origin_month    INTEGER NOT NULL,
    initial         BIGINT NOT NULL,
    available       BIGINT NOT NULL,
    expiry_date     DATE NOT NULL,
    state           pool_state NOT NULL DEFAULT 'active',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_overflow_pools_month CHECK (origin_month BETWEEN 1 AND 12),
    CONSTRAINT chk_overflow_pools_initial CHECK (initial > 0),
    CONSTRAINT chk_overflow_pools_available CHECK (available >= 0 AND available <= initial)
);

CREATE INDEX idx_overflow_pools_spendable
    ON overflow_pools(tenant_id, origin_year, origin_month, created_at)
    WHERE state = 'active';
CREATE INDEX idx_overflow_pools_origin ON overflow_pools(tenant_id, origin_year, origin_month);
";

const TOP_UPS_SQL: &str = r"
CREATE TABLE top_ups (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    year            INTEGER NOT NULL,
    month           INTEGER NOT NULL,
    purchased       BIGINT NOT NULL,
    available       BIGINT NOT NULL,
    state           top_up_state NOT NULL DEFAULT 'active',
    purchased_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_top_ups_month CHECK (month BETWEEN 1 AND 12),
    CONSTRAINT chk_top_ups_purchased CHECK (purchased > 0),
    CONSTRAINT chk_top_ups_available CHECK (available >= 0)
);

CREATE INDEX idx_top_ups_month ON top_ups(tenant_id, year, month, purchased_at);
";

const CONSUMPTION_LEDGER_SQL: &str = r"
CREATE TABLE consumption_ledger (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    op              consumption_op NOT NULL,
    source          quota_source NOT NULL,
    source_id       UUID NOT NULL,
    amount          BIGINT NOT NULL,
    balance_before  BIGINT NOT NULL,
    balance_after   BIGINT NOT NULL,
    document_id     UUID,
    reversal_of     UUID REFERENCES consumption_ledger(id),
    period_year     INTEGER,
    period_month    INTEGER,
    actor           UUID,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT chk_consumption_ledger_amount CHECK (amount >= 0),
    CONSTRAINT chk_consumption_ledger_reversal CHECK (
        (op = 'reverse') = (reversal_of IS NOT NULL)
    ),
    CONSTRAINT chk_consumption_ledger_period CHECK (
        (period_year IS NULL) = (period_month IS NULL)
    )
);

-- A consumption row can be reversed at most once.
CREATE UNIQUE INDEX uq_consumption_ledger_reversal
    ON consumption_ledger(reversal_of)
    WHERE reversal_of IS NOT NULL;

CREATE INDEX idx_consumption_ledger_document
    ON consumption_ledger(document_id, created_at)
    WHERE document_id IS NOT NULL;
CREATE INDEX idx_consumption_ledger_source ON consumption_ledger(source_id, op, created_at);
CREATE INDEX idx_consumption_ledger_tenant ON consumption_ledger(tenant_id, created_at);
";

const DROP_ALL_SQL: &str = r"
-- ============================================================
-- DROP ALL: Rollback migration
-- Order matters due to foreign key constraints
-- ============================================================

DROP TABLE IF EXISTS consumption_ledger CASCADE;
DROP TABLE IF EXISTS top_ups CASCADE;
DROP TABLE IF EXISTS overflow_pools CASCADE;
DROP TABLE IF EXISTS quota_plans CASCADE;
DROP TABLE IF EXISTS operation_logs CASCADE;
DROP TABLE IF EXISTS trashed_line_entries CASCADE;
DROP TABLE IF EXISTS trashed_documents CASCADE;
DROP TABLE IF EXISTS line_entries CASCADE;
DROP TABLE IF EXISTS ledger_documents CASCADE;
DROP TABLE IF EXISTS document_sequences CASCADE;
DROP TABLE IF EXISTS closed_periods CASCADE;

DROP TYPE IF EXISTS quota_source;
DROP TYPE IF EXISTS consumption_op;
DROP TYPE IF EXISTS top_up_state;
DROP TYPE IF EXISTS pool_state;
DROP TYPE IF EXISTS plan_state;
DROP TYPE IF EXISTS operation_kind;
DROP TYPE IF EXISTS counterparty_ledger;
DROP TYPE IF EXISTS movement_kind;
DROP TYPE IF EXISTS document_status;
";
