//! Ledger documents: numbering, validation and the document lifecycle.
//!
//! - `types` - documents, lines, trash and audit records
//! - `validation` - balance and line rules
//! - `sequence` - per document type numbering
//! - `service` - the unit-of-work orchestrator

pub mod error;
pub mod sequence;
pub mod service;
pub mod types;
pub mod validation;

#[cfg(test)]
mod service_tests;
#[cfg(test)]
mod validation_props;

pub use error::LedgerError;
pub use sequence::SequenceAllocator;
pub use service::DocumentLedgerService;
pub use types::{
    CounterpartyLedger, CreateDocumentInput, DocumentStatus, DocumentTotals,
    DocumentTypeSequence, DocumentTypeSettings, DocumentWithLines, LedgerDocument, LineEntry,
    LineEntryInput, MovementKind, OperationKind, OperationLog, TrashedDocument, TrashedLineEntry,
    UpdateDocumentInput, build_lines,
};
pub use validation::{validate_due_date, validate_lines};
