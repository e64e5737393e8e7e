use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 一条改名边。可能由其他工具写入，读取时重新校验。
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "backtest_strategy_rename_map")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub from_id: String,
    pub to_id: String,
    pub updated_at: i64, // unix millis
    pub updated_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
