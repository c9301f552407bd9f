//! Ledger domain types: documents, line entries, numbering and the audit archive.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_shared::types::{
    AccountId, CostCenterId, CounterpartyId, DocumentId, DocumentTypeId, LineEntryId,
    OperationLogId, ProductId, TenantId, UserId, WarehouseId, round_to_scale,
};

/// Document status.
///
/// Trashed documents leave the active tables entirely, so TRASHED is not a status
/// a live row can carry; see [`TrashedDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Document counts towards balances.
    Active,
    /// Document was soft-reversed and is kept for audit.
    Voided,
}

impl DocumentStatus {
    /// Lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Voided => "voided",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the inventory movement a document type posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    /// Goods enter the warehouse (purchases, returns from customers).
    In,
    /// Goods leave the warehouse (sales, returns to suppliers).
    Out,
}

/// Which counterparty balance ledger a document type feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterpartyLedger {
    /// Accounts receivable.
    Receivable,
    /// Accounts payable.
    Payable,
}

/// Numbering state and behaviour flags of one document type for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTypeSequence {
    /// Tenant owning the numbering.
    pub tenant_id: TenantId,
    /// Document type being numbered.
    pub doc_type_id: DocumentTypeId,
    /// Highest number handed out so far.
    pub current_number: i64,
    /// Numbers are supplied by the caller instead of allocated.
    pub manual_numbering: bool,
    /// Inventory movement posted for product lines, if any.
    pub inventory_effect: Option<MovementKind>,
    /// Counterparty ledger fed by this type, if any.
    pub counterparty_ledger: Option<CounterpartyLedger>,
}

impl DocumentTypeSequence {
    /// A fresh auto-numbered sequence with no collaborator effects.
    #[must_use]
    pub fn new(tenant_id: TenantId, doc_type_id: DocumentTypeId) -> Self {
        Self {
            tenant_id,
            doc_type_id,
            current_number: 0,
            manual_numbering: false,
            inventory_effect: None,
            counterparty_ledger: None,
        }
    }

    /// Returns true if documents of this type post inventory movements.
    #[must_use]
    pub fn affects_inventory(&self) -> bool {
        self.inventory_effect.is_some()
    }

    /// Returns true if documents of this type feed AR/AP balances.
    #[must_use]
    pub fn affects_counterparty_balances(&self) -> bool {
        self.counterparty_ledger.is_some()
    }
}

/// Settings applied by `configure_document_type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTypeSettings {
    /// Numbers are supplied by the caller.
    pub manual_numbering: bool,
    /// Inventory movement posted for product lines.
    pub inventory_effect: Option<MovementKind>,
    /// Counterparty ledger fed by the type.
    pub counterparty_ledger: Option<CounterpartyLedger>,
}

/// Ledger document header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    /// Document ID.
    pub id: DocumentId,
    /// Tenant owning the document.
    pub tenant_id: TenantId,
    /// Document type.
    pub doc_type_id: DocumentTypeId,
    /// Number within (tenant, document type).
    pub sequence_number: i64,
    /// Accounting date; decides which fiscal month the document lives in.
    pub date: NaiveDate,
    /// Optional due date for AR/AP documents.
    pub due_date: Option<NaiveDate>,
    /// Customer or supplier.
    pub counterparty_id: Option<CounterpartyId>,
    /// Header-level cost center.
    pub cost_center_id: Option<CostCenterId>,
    /// Warehouse used for inventory movements.
    pub warehouse_id: Option<WarehouseId>,
    /// Free-form description.
    pub description: Option<String>,
    /// Current status.
    pub status: DocumentStatus,
    /// Creator.
    pub created_by: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the document was voided.
    pub voided_at: Option<DateTime<Utc>>,
    /// Who voided the document.
    pub voided_by: Option<UserId>,
    /// Why the document was voided.
    pub void_reason: Option<String>,
}

/// One debit or credit row of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// Line ID.
    pub id: LineEntryId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Zero-based position within the document.
    pub position: i32,
    /// Account posted to.
    pub account_id: AccountId,
    /// Debit amount (zero for credit lines).
    pub debit: Decimal,
    /// Credit amount (zero for debit lines).
    pub credit: Decimal,
    /// Line-level cost center.
    pub cost_center_id: Option<CostCenterId>,
    /// Line description.
    pub concept: String,
    /// Product moved by this line.
    pub product_id: Option<ProductId>,
    /// Quantity moved.
    pub quantity: Option<Decimal>,
    /// Unit cost of the movement; derived from the amount when absent.
    pub unit_cost: Option<Decimal>,
}

impl LineEntry {
    /// The non-zero side of the line.
    #[must_use]
    pub fn amount(&self) -> Decimal {
        self.debit + self.credit
    }
}

/// Input for a single line entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntryInput {
    /// Account posted to.
    pub account_id: AccountId,
    /// Debit amount.
    pub debit: Decimal,
    /// Credit amount.
    pub credit: Decimal,
    /// Line-level cost center.
    pub cost_center_id: Option<CostCenterId>,
    /// Line description.
    pub concept: String,
    /// Product moved by this line.
    pub product_id: Option<ProductId>,
    /// Quantity moved.
    pub quantity: Option<Decimal>,
    /// Unit cost of the movement.
    pub unit_cost: Option<Decimal>,
}

impl LineEntryInput {
    /// A debit line.
    #[must_use]
    pub fn debit(account_id: AccountId, amount: Decimal, concept: impl Into<String>) -> Self {
        Self {
            account_id,
            debit: amount,
            credit: Decimal::ZERO,
            cost_center_id: None,
            concept: concept.into(),
            product_id: None,
            quantity: None,
            unit_cost: None,
        }
    }

    /// A credit line.
    #[must_use]
    pub fn credit(account_id: AccountId, amount: Decimal, concept: impl Into<String>) -> Self {
        Self {
            account_id,
            debit: Decimal::ZERO,
            credit: amount,
            cost_center_id: None,
            concept: concept.into(),
            product_id: None,
            quantity: None,
            unit_cost: None,
        }
    }

    /// Attaches a product movement to the line.
    #[must_use]
    pub fn with_product(mut self, product_id: ProductId, quantity: Decimal) -> Self {
        self.product_id = Some(product_id);
        self.quantity = Some(quantity);
        self
    }

    /// Attaches a cost center to the line.
    #[must_use]
    pub fn with_cost_center(mut self, cost_center_id: CostCenterId) -> Self {
        self.cost_center_id = Some(cost_center_id);
        self
    }

    /// Materializes the input as a stored line, rounding amounts to the persisted scale.
    #[must_use]
    pub fn into_line(self, document_id: DocumentId, position: i32) -> LineEntry {
        LineEntry {
            id: LineEntryId::new(),
            document_id,
            position,
            account_id: self.account_id,
            debit: round_to_scale(self.debit),
            credit: round_to_scale(self.credit),
            cost_center_id: self.cost_center_id,
            concept: self.concept,
            product_id: self.product_id,
            quantity: self.quantity.map(round_to_scale),
            unit_cost: self.unit_cost.map(round_to_scale),
        }
    }
}

/// Materializes a list of inputs as stored lines in input order.
#[must_use]
pub fn build_lines(document_id: DocumentId, inputs: Vec<LineEntryInput>) -> Vec<LineEntry> {
    inputs
        .into_iter()
        .zip(0_i32..)
        .map(|(input, position)| input.into_line(document_id, position))
        .collect()
}

/// Input for creating a document.
#[derive(Debug, Clone)]
pub struct CreateDocumentInput {
    /// Tenant owning the document.
    pub tenant_id: TenantId,
    /// Document type.
    pub doc_type_id: DocumentTypeId,
    /// Accounting date.
    pub date: NaiveDate,
    /// Optional due date.
    pub due_date: Option<NaiveDate>,
    /// Customer or supplier.
    pub counterparty_id: Option<CounterpartyId>,
    /// Header-level cost center.
    pub cost_center_id: Option<CostCenterId>,
    /// Warehouse for inventory movements.
    pub warehouse_id: Option<WarehouseId>,
    /// Free-form description.
    pub description: Option<String>,
    /// Caller-supplied number; required for manual-numbering types, rejected otherwise.
    pub number: Option<i64>,
    /// Line entries (at least 2, balanced).
    pub lines: Vec<LineEntryInput>,
    /// Creator.
    pub created_by: UserId,
}

/// Input for updating an ACTIVE document. Lines are replaced wholesale.
#[derive(Debug, Clone)]
pub struct UpdateDocumentInput {
    /// Tenant owning the document.
    pub tenant_id: TenantId,
    /// Document being updated.
    pub document_id: DocumentId,
    /// New accounting date.
    pub date: NaiveDate,
    /// New due date.
    pub due_date: Option<NaiveDate>,
    /// New counterparty.
    pub counterparty_id: Option<CounterpartyId>,
    /// New header cost center.
    pub cost_center_id: Option<CostCenterId>,
    /// Replacement line entries.
    pub lines: Vec<LineEntryInput>,
    /// Who made the change.
    pub actor: UserId,
}

/// A document with its lines in position order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentWithLines {
    /// Header.
    pub document: LedgerDocument,
    /// Lines.
    pub lines: Vec<LineEntry>,
}

impl DocumentWithLines {
    /// Totals of the stored lines.
    #[must_use]
    pub fn totals(&self) -> DocumentTotals {
        DocumentTotals::new(
            self.lines.iter().map(|l| l.debit).sum(),
            self.lines.iter().map(|l| l.credit).sum(),
        )
    }
}

/// Document totals for validation and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTotals {
    /// Total debit.
    pub debit: Decimal,
    /// Total credit.
    pub credit: Decimal,
    /// Whether debits equal credits.
    pub is_balanced: bool,
}

impl DocumentTotals {
    /// Creates totals from debit and credit sums.
    #[must_use]
    pub fn new(debit: Decimal, credit: Decimal) -> Self {
        Self {
            debit,
            credit,
            is_balanced: debit == credit,
        }
    }

    /// Returns the difference between debits and credits.
    #[must_use]
    pub fn difference(&self) -> Decimal {
        self.debit - self.credit
    }
}

/// A hard-deleted document, archived under its original ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashedDocument {
    /// The document as it was when deleted.
    pub original: LedgerDocument,
    /// Why it was deleted.
    pub deletion_reason: String,
    /// Who deleted it.
    pub deleted_by: UserId,
    /// When it was deleted.
    pub deleted_at: DateTime<Utc>,
}

/// A line of a hard-deleted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashedLineEntry {
    /// The line as it was when deleted.
    pub original: LineEntry,
    /// When it was deleted.
    pub deleted_at: DateTime<Utc>,
}

/// Kind of audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Document voided.
    Void,
    /// Document moved to trash.
    Delete,
    /// Document updated.
    Modify,
    /// Voided document restored.
    Reactivate,
}

impl OperationKind {
    /// Lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Delete => "delete",
            Self::Modify => "modify",
            Self::Reactivate => "reactivate",
        }
    }
}

/// Append-only audit entry carrying a full pre-operation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    /// Entry ID.
    pub id: OperationLogId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// Document the operation touched. Not a foreign key: the log outlives deletes.
    pub document_id: DocumentId,
    /// Operation performed.
    pub kind: OperationKind,
    /// Caller-supplied reason.
    pub reason: Option<String>,
    /// Who performed it.
    pub actor: UserId,
    /// JSON snapshot of the document and its lines before the operation.
    pub snapshot: serde_json::Value,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}

impl OperationLog {
    /// Builds an entry snapshotting `document` before the operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized.
    pub fn snapshot_of(
        document: &DocumentWithLines,
        kind: OperationKind,
        reason: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: OperationLogId::new(),
            tenant_id: document.document.tenant_id,
            document_id: document.document.id,
            kind,
            reason,
            actor,
            snapshot: serde_json::to_value(document)?,
            created_at: now,
        })
    }
}
