//! `SeaORM` entities for the ledger schema.

#![allow(missing_docs)]

pub mod prelude;

pub mod closed_periods;
pub mod consumption_ledger;
pub mod document_sequences;
pub mod ledger_documents;
pub mod line_entries;
pub mod operation_logs;
pub mod overflow_pools;
pub mod quota_plans;
pub mod sea_orm_active_enums;
pub mod top_ups;
pub mod trashed_documents;
pub mod trashed_line_entries;
