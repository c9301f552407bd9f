//! `SeaORM` Entity for ledger_documents table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::sea_orm_active_enums::DocumentStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub doc_type_id: Uuid,
    pub sequence_number: i64,
    pub date: Date,
    pub due_date: Option<Date>,
    pub counterparty_id: Option<Uuid>,
    pub cost_center_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    pub description: Option<String>,
    pub status: DocumentStatus,
    pub created_by: Uuid,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub voided_at: Option<DateTimeWithTimeZone>,
    pub voided_by: Option<Uuid>,
    pub void_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::line_entries::Entity")]
    LineEntries,
}

impl Related<super::line_entries::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LineEntries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
