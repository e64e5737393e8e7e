use crate::storage::entity::strategy_rename::{
    self, ActiveModel as StrategyRenameActiveModel, Entity as StrategyRename,
};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};

pub struct RenameRepository;

impl RenameRepository {
    /// 原样读取全部行，校验由调用方负责
    pub async fn load_rows<C: ConnectionTrait>(
        db: &C,
    ) -> Result<Vec<strategy_rename::Model>, sea_orm::DbErr> {
        StrategyRename::find().all(db).await
    }

    pub async fn upsert_edge<C: ConnectionTrait>(
        db: &C,
        from_id: &str,
        to_id: &str,
        updated_by: Option<&str>,
    ) -> Result<(), sea_orm::DbErr> {
        let model = StrategyRenameActiveModel {
            from_id: Set(from_id.to_string()),
            to_id: Set(to_id.to_string()),
            updated_at: Set(Utc::now().timestamp_millis()),
            updated_by: Set(updated_by.map(|s| s.to_string())),
        };
        StrategyRename::insert(model)
            .on_conflict(
                OnConflict::column(strategy_rename::Column::FromId)
                    .update_columns([
                        strategy_rename::Column::ToId,
                        strategy_rename::Column::UpdatedAt,
                        strategy_rename::Column::UpdatedBy,
                    ])
                    .to_owned(),
            )
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn delete_edges<C: ConnectionTrait>(
        db: &C,
        from_ids: &[String],
    ) -> Result<u64, sea_orm::DbErr> {
        if from_ids.is_empty() {
            return Ok(0);
        }
        let res = StrategyRename::delete_many()
            .filter(strategy_rename::Column::FromId.is_in(from_ids.iter().cloned()))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }
}
