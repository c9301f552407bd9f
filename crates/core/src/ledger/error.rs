//! Ledger error types.
//!
//! Every failure a ledger operation can report, grouped the way callers react to
//! them: validation, period locks, quota, numbering, document state, and
//! infrastructure. Any error aborts the whole unit of work.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tally_shared::AppError;
use tally_shared::types::{DocumentId, DocumentTypeId, TenantId};
use thiserror::Error;

use crate::ledger::types::DocumentStatus;
use crate::store::StoreError;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    // ========== Validation Errors ==========
    /// Document must have at least 2 line entries.
    #[error("Document must have at least 2 line entries")]
    InsufficientEntries,

    /// A line entry is malformed.
    #[error("Line {position} is invalid: {reason}")]
    InvalidLine {
        /// Zero-based line position.
        position: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// Document is not balanced (debits != credits).
    #[error("Document is not balanced. Debit: {debit}, Credit: {credit}")]
    UnbalancedEntry {
        /// Total debit.
        debit: Decimal,
        /// Total credit.
        credit: Decimal,
    },

    /// Quantity is negative, fractional or out of range.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Month outside 1-12.
    #[error("Invalid period {year}-{month}")]
    InvalidPeriod {
        /// Year given.
        year: i32,
        /// Month given.
        month: u32,
    },

    /// Due date precedes the document date.
    #[error("Due date {due_date} is before document date {date}")]
    InvalidDueDate {
        /// Document date.
        date: NaiveDate,
        /// Due date given.
        due_date: NaiveDate,
    },

    /// Document type numbers manually but no number was supplied.
    #[error("Document type {0} requires a manual number")]
    ManualNumberRequired(DocumentTypeId),

    /// Document type numbers automatically but a number was supplied.
    #[error("Document type {0} numbers automatically; a manual number is not allowed")]
    ManualNumberNotAllowed(DocumentTypeId),

    // ========== Period Errors ==========
    /// The month is closed; nothing dated inside it can change.
    #[error("Period {year}-{month:02} is closed for tenant {tenant_id}")]
    PeriodClosed {
        /// Tenant.
        tenant_id: TenantId,
        /// Closed year.
        year: i32,
        /// Closed month.
        month: u32,
    },

    /// The previous month must be closed first.
    #[error("Cannot close period: previous period {year}-{month:02} is still open")]
    PreviousPeriodOpen {
        /// Year of the open month.
        year: i32,
        /// The open month.
        month: u32,
    },

    /// The following month must be reopened first.
    #[error("Cannot reopen period: following period {year}-{month:02} is closed")]
    FollowingPeriodClosed {
        /// Year of the closed month.
        year: i32,
        /// The closed month.
        month: u32,
    },

    /// Reopen was asked for a month that is not closed.
    #[error("Period {year}-{month:02} is not closed")]
    PeriodNotClosed {
        /// Year asked for.
        year: i32,
        /// Month asked for.
        month: u32,
    },

    /// Quota can only be provisioned or topped up for an OPEN month.
    #[error("Quota plan for {year}-{month:02} is not open")]
    PlanNotOpen {
        /// Year asked for.
        year: i32,
        /// Month asked for.
        month: u32,
    },

    // ========== Quota Errors ==========
    /// Not enough units across all sources.
    #[error(
        "Insufficient quota: requested {requested}, available {total_available} \
         (plan {plan_available}, overflow {overflow_available}, top-up {top_up_available})"
    )]
    InsufficientQuota {
        /// Units asked for.
        requested: i64,
        /// Spendable plan units.
        plan_available: i64,
        /// Spendable overflow units.
        overflow_available: i64,
        /// Spendable top-up units.
        top_up_available: i64,
        /// Sum of all sources.
        total_available: i64,
    },

    /// A stored quota balance went out of bounds.
    #[error("Quota invariant violated: {0}")]
    QuotaInvariant(String),

    // ========== Numbering Errors ==========
    /// Another live document already holds the number.
    #[error("Document number {number} is already taken for document type {doc_type_id}")]
    SequenceConflict {
        /// Document type.
        doc_type_id: DocumentTypeId,
        /// Conflicting number.
        number: i64,
    },

    // ========== Document State Errors ==========
    /// Document not found.
    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    /// Operation requires a different document status.
    #[error("Document {document_id} is {actual}, expected {expected}")]
    InvalidDocumentState {
        /// Document.
        document_id: DocumentId,
        /// Status the operation needs.
        expected: DocumentStatus,
        /// Status found.
        actual: DocumentStatus,
    },

    // ========== Infrastructure Errors ==========
    /// An inventory call failed inside the unit of work.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Returns the error code for API responses.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientEntries => "INSUFFICIENT_ENTRIES",
            Self::InvalidLine { .. } => "INVALID_LINE",
            Self::UnbalancedEntry { .. } => "UNBALANCED_ENTRY",
            Self::InvalidQuantity(_) => "INVALID_QUANTITY",
            Self::InvalidPeriod { .. } => "INVALID_PERIOD",
            Self::InvalidDueDate { .. } => "INVALID_DUE_DATE",
            Self::ManualNumberRequired(_) => "MANUAL_NUMBER_REQUIRED",
            Self::ManualNumberNotAllowed(_) => "MANUAL_NUMBER_NOT_ALLOWED",
            Self::PeriodClosed { .. } => "PERIOD_CLOSED",
            Self::PreviousPeriodOpen { .. } => "PREVIOUS_PERIOD_OPEN",
            Self::FollowingPeriodClosed { .. } => "FOLLOWING_PERIOD_CLOSED",
            Self::PeriodNotClosed { .. } => "PERIOD_NOT_CLOSED",
            Self::PlanNotOpen { .. } => "PLAN_NOT_OPEN",
            Self::InsufficientQuota { .. } => "INSUFFICIENT_QUOTA",
            Self::QuotaInvariant(_) => "QUOTA_INVARIANT",
            Self::SequenceConflict { .. } => "SEQUENCE_CONFLICT",
            Self::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
            Self::InvalidDocumentState { .. } => "INVALID_DOCUMENT_STATE",
            Self::Collaborator(_) => "COLLABORATOR_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SequenceConflict { .. })
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("snapshot serialization failed: {err}"))
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::InsufficientEntries
            | LedgerError::InvalidLine { .. }
            | LedgerError::UnbalancedEntry { .. }
            | LedgerError::InvalidQuantity(_)
            | LedgerError::InvalidPeriod { .. }
            | LedgerError::InvalidDueDate { .. }
            | LedgerError::ManualNumberRequired(_)
            | LedgerError::ManualNumberNotAllowed(_) => Self::Validation(message),
            LedgerError::DocumentNotFound(_) => Self::NotFound(message),
            LedgerError::SequenceConflict { .. } => Self::Conflict(message),
            LedgerError::PeriodClosed { .. }
            | LedgerError::PreviousPeriodOpen { .. }
            | LedgerError::FollowingPeriodClosed { .. }
            | LedgerError::PeriodNotClosed { .. }
            | LedgerError::PlanNotOpen { .. }
            | LedgerError::InsufficientQuota { .. }
            | LedgerError::InvalidDocumentState { .. } => Self::BusinessRule(message),
            LedgerError::Collaborator(_) => Self::ExternalService(message),
            LedgerError::Storage(_) => Self::Database(message),
            LedgerError::QuotaInvariant(_) | LedgerError::Internal(_) => Self::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::InsufficientEntries.error_code(), "INSUFFICIENT_ENTRIES");
        assert_eq!(
            LedgerError::UnbalancedEntry {
                debit: Decimal::new(100, 2),
                credit: Decimal::new(50, 2),
            }
            .error_code(),
            "UNBALANCED_ENTRY"
        );
        assert_eq!(
            LedgerError::PeriodClosed {
                tenant_id: TenantId::new(),
                year: 2025,
                month: 1,
            }
            .error_code(),
            "PERIOD_CLOSED"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(
            LedgerError::SequenceConflict {
                doc_type_id: DocumentTypeId::new(),
                number: 1,
            }
            .is_retryable()
        );
        assert!(!LedgerError::InsufficientEntries.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = LedgerError::UnbalancedEntry {
            debit: Decimal::new(10000, 2),
            credit: Decimal::new(5000, 2),
        };
        assert_eq!(
            err.to_string(),
            "Document is not balanced. Debit: 100.00, Credit: 50.00"
        );

        let err = LedgerError::InsufficientQuota {
            requested: 10,
            plan_available: 2,
            overflow_available: 3,
            top_up_available: 0,
            total_available: 5,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient quota: requested 10, available 5 (plan 2, overflow 3, top-up 0)"
        );
    }

    #[test]
    fn test_maps_into_app_error() {
        let app: AppError = LedgerError::InsufficientEntries.into();
        assert_eq!(app.error_code(), "VALIDATION_ERROR");

        let app: AppError = LedgerError::DocumentNotFound(DocumentId::new()).into();
        assert_eq!(app.error_code(), "NOT_FOUND");

        let app: AppError = LedgerError::Storage(StoreError::Backend("down".to_string())).into();
        assert_eq!(app.error_code(), "DATABASE_ERROR");

        let app: AppError = LedgerError::SequenceConflict {
            doc_type_id: DocumentTypeId::new(),
            number: 9,
        }
        .into();
        assert_eq!(app.error_code(), "CONFLICT");
    }
}
