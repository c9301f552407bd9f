//! `SeaORM` active enums mirroring the Postgres enum types.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "document_status")]
pub enum DocumentStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "voided")]
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "movement_kind")]
pub enum MovementKind {
    #[sea_orm(string_value = "in")]
    In,
    #[sea_orm(string_value = "out")]
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "counterparty_ledger")]
pub enum CounterpartyLedger {
    #[sea_orm(string_value = "receivable")]
    Receivable,
    #[sea_orm(string_value = "payable")]
    Payable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "operation_kind")]
pub enum OperationKind {
    #[sea_orm(string_value = "void")]
    Void,
    #[sea_orm(string_value = "delete")]
    Delete,
    #[sea_orm(string_value = "modify")]
    Modify,
    #[sea_orm(string_value = "reactivate")]
    Reactivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "plan_state")]
pub enum PlanState {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "pool_state")]
pub enum PoolState {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "exhausted")]
    Exhausted,
    #[sea_orm(string_value = "voided")]
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "top_up_state")]
pub enum TopUpState {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "expired")]
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "consumption_op")]
pub enum ConsumptionOp {
    #[sea_orm(string_value = "consume")]
    Consume,
    #[sea_orm(string_value = "reverse")]
    Reverse,
    #[sea_orm(string_value = "close")]
    Close,
    #[sea_orm(string_value = "expire")]
    Expire,
    #[sea_orm(string_value = "reopen")]
    Reopen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "quota_source")]
pub enum QuotaSource {
    #[sea_orm(string_value = "plan")]
    Plan,
    #[sea_orm(string_value = "overflow")]
    Overflow,
    #[sea_orm(string_value = "top_up")]
    TopUp,
}
