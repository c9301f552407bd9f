//! Common types used across the application.

pub mod amount;
pub mod id;

pub use amount::{LEDGER_SCALE, fits_persisted_range, is_whole, round_to_scale};
pub use id::*;
