//! `PostgreSQL` storage for the Tally ledger.
//!
//! This crate provides:
//! - `SeaORM` entity definitions for the ledger tables
//! - Database migrations
//! - [`PgLedgerStore`], the production implementation of the core storage ports

pub mod entities;
pub mod migration;
pub mod store;

mod convert;

pub use migration::Migrator;
pub use store::{PgLedgerStore, PgLedgerTx};

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tally_shared::DatabaseConfig;

/// Establishes a connection to the database.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    Database::connect(database_url).await
}

/// Connects using the pool settings of a [`DatabaseConfig`].
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect_with(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .sqlx_logging(false);
    Database::connect(options).await
}
