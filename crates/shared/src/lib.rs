//! Shared types, errors, and configuration for Tally.
//!
//! This crate provides common types used across all other crates:
//! - Typed IDs for type-safe entity references
//! - Fixed-point amount helpers
//! - Application-wide error types
//! - Configuration management
//! - Tracing subscriber bootstrap

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::{AppConfig, DatabaseConfig, LedgerConfig, LoggingConfig, RecalcMode};
pub use error::{AppError, AppResult};
pub use telemetry::init_tracing;
