//! Interfaces the ledger calls into: inventory and counterparty balances.
//!
//! Inventory runs inside the unit of work and a failure aborts it. Counterparty
//! balances are recalculated after commit through
//! [`RecalculationDispatcher`](crate::recalc::RecalculationDispatcher).

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_shared::types::{CounterpartyId, DocumentId, ProductId, TenantId, WarehouseId};
use thiserror::Error;

use crate::ledger::types::MovementKind;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error)]
#[error("{service}: {message}")]
pub struct CollaboratorError {
    /// Which collaborator failed.
    pub service: &'static str,
    /// What went wrong.
    pub message: String,
}

impl CollaboratorError {
    /// Creates an error.
    #[must_use]
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

/// One stock movement posted for a document line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMovement {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Product moved.
    pub product_id: ProductId,
    /// Warehouse, if the document names one.
    pub warehouse_id: Option<WarehouseId>,
    /// Direction.
    pub kind: MovementKind,
    /// Quantity moved.
    pub quantity: Decimal,
    /// Cost per unit.
    pub unit_cost: Decimal,
    /// Document posting the movement.
    pub document_id: DocumentId,
    /// Movement date (the document date).
    pub date: NaiveDate,
}

/// Inventory subsystem.
#[async_trait]
pub trait InventoryPort: Send + Sync {
    /// Records a stock movement.
    async fn post_movement(&self, movement: &InventoryMovement) -> Result<(), CollaboratorError>;

    /// Reverses every movement a document posted.
    async fn reverse_movements_of(&self, document_id: DocumentId) -> Result<(), CollaboratorError>;

    /// Recomputes running balances of the given products.
    async fn recompute_balances(&self, product_ids: &[ProductId]) -> Result<(), CollaboratorError>;
}

/// Accounts receivable / payable subsystem.
#[async_trait]
pub trait CounterpartyBalances: Send + Sync {
    /// Recomputes the balance of one counterparty. Must be idempotent.
    async fn recalculate_for_counterparty(
        &self,
        counterparty_id: CounterpartyId,
        tenant_id: TenantId,
    ) -> Result<(), CollaboratorError>;
}

/// Inventory that does nothing, for deployments without stock tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInventory;

#[async_trait]
impl InventoryPort for NoopInventory {
    async fn post_movement(&self, _movement: &InventoryMovement) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn reverse_movements_of(&self, _document_id: DocumentId) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn recompute_balances(&self, _product_ids: &[ProductId]) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Balances that do nothing, for deployments without AR/AP.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBalances;

#[async_trait]
impl CounterpartyBalances for NoopBalances {
    async fn recalculate_for_counterparty(
        &self,
        _counterparty_id: CounterpartyId,
        _tenant_id: TenantId,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}
