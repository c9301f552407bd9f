//! Entity aliases.

pub use super::closed_periods::Entity as ClosedPeriods;
pub use super::consumption_ledger::Entity as ConsumptionLedger;
pub use super::document_sequences::Entity as DocumentSequences;
pub use super::ledger_documents::Entity as LedgerDocuments;
pub use super::line_entries::Entity as LineEntries;
pub use super::operation_logs::Entity as OperationLogs;
pub use super::overflow_pools::Entity as OverflowPools;
pub use super::quota_plans::Entity as QuotaPlans;
pub use super::top_ups::Entity as TopUps;
pub use super::trashed_documents::Entity as TrashedDocuments;
pub use super::trashed_line_entries::Entity as TrashedLineEntries;
