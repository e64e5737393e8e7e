use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "job_index")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: String,
    pub strategy_id: Option<String>, // legacy rows may lack it; meta.json is the fallback
    pub status: String,              // QUEUED/RUNNING/FINISHED/FAILED/CANCELLED
    pub created_at: i64,             // unix millis
    pub updated_at: i64,             // unix millis
    pub params_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub job_dir: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
