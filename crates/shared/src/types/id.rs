//! Typed IDs for type-safe entity references.
//!
//! Using typed IDs prevents accidentally passing a `DocumentId` where a `TenantId` is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Macro to generate typed ID wrappers.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random ID using UUID v7 (time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates an ID from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner UUID.
            #[must_use]
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

typed_id!(TenantId, "Unique identifier for a tenant (the company keeping the books).");
typed_id!(UserId, "Unique identifier for the user performing an operation.");
typed_id!(DocumentId, "Unique identifier for a ledger document.");
typed_id!(DocumentTypeId, "Unique identifier for a document type (invoice, payment, ...).");
typed_id!(LineEntryId, "Unique identifier for a document line entry.");
typed_id!(AccountId, "Unique identifier for a chart of accounts entry.");
typed_id!(CounterpartyId, "Unique identifier for a customer or supplier.");
typed_id!(CostCenterId, "Unique identifier for a cost center.");
typed_id!(ProductId, "Unique identifier for an inventory product.");
typed_id!(WarehouseId, "Unique identifier for a warehouse.");
typed_id!(QuotaPlanId, "Unique identifier for a monthly quota plan row.");
typed_id!(OverflowPoolId, "Unique identifier for an overflow pool.");
typed_id!(TopUpId, "Unique identifier for a purchased top-up.");
typed_id!(ConsumptionEntryId, "Unique identifier for a consumption ledger entry.");
typed_id!(OperationLogId, "Unique identifier for an operation log entry.");
