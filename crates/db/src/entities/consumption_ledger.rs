//! `SeaORM` Entity for consumption_ledger table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::sea_orm_active_enums::{ConsumptionOp, QuotaSource};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "consumption_ledger")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub op: ConsumptionOp,
    pub source: QuotaSource,
    pub source_id: Uuid,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub document_id: Option<Uuid>,
    pub reversal_of: Option<Uuid>,
    pub period_year: Option<i32>,
    pub period_month: Option<i32>,
    pub actor: Option<Uuid>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
