//! Core business logic for Tally.
//!
//! This crate holds the ledger rules with no web or database dependencies.
//! Persistence is reached through the ports in [`store`]; a PostgreSQL
//! implementation lives in `tally-db`.
//!
//! # Modules
//!
//! - `ledger` - Documents, numbering and the lifecycle service
//! - `fiscal` - Fiscal months and the period lock
//! - `quota` - Monthly plans, overflow pools, top-ups and period close
//! - `store` - Storage ports and the in-memory store
//! - `collaborators` - Inventory and AR/AP interfaces
//! - `recalc` - Post-commit counterparty recalculation

pub mod clock;
pub mod collaborators;
pub mod fiscal;
pub mod ledger;
pub mod quota;
pub mod recalc;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use ledger::{DocumentLedgerService, LedgerError};
pub use store::{LedgerStore, LedgerTx, MemoryLedgerStore, StoreError};
