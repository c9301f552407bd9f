//! `SeaORM` Entity for line_entries table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "line_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub document_id: Uuid,
    pub position: i32,
    pub account_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub debit: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub credit: Decimal,
    pub cost_center_id: Option<Uuid>,
    #[sea_orm(column_type = "Text")]
    pub concept: String,
    pub product_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub quantity: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub unit_cost: Option<Decimal>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::ledger_documents::Entity",
        from = "Column::DocumentId",
        to = "super::ledger_documents::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    LedgerDocuments,
}

impl Related<super::ledger_documents::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LedgerDocuments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
