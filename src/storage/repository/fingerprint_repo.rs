use crate::storage::entity::run_fingerprint::{
    self, ActiveModel as RunFingerprintActiveModel, Entity as RunFingerprint,
};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};

pub struct FingerprintRepository;

impl FingerprintRepository {
    pub async fn find<C: ConnectionTrait>(
        db: &C,
        fingerprint: &str,
    ) -> Result<Option<run_fingerprint::Model>, sea_orm::DbErr> {
        RunFingerprint::find_by_id(fingerprint.to_string())
            .one(db)
            .await
    }

    /// 绑定指纹到最新任务，已存在则覆盖
    pub async fn bind<C: ConnectionTrait>(
        db: &C,
        fingerprint: &str,
        job_id: &str,
        created_at: i64,
    ) -> Result<(), sea_orm::DbErr> {
        let model = RunFingerprintActiveModel {
            fingerprint: Set(fingerprint.to_string()),
            job_id: Set(job_id.to_string()),
            created_at: Set(created_at),
        };
        RunFingerprint::insert(model)
            .on_conflict(
                OnConflict::column(run_fingerprint::Column::Fingerprint)
                    .update_columns([
                        run_fingerprint::Column::JobId,
                        run_fingerprint::Column::CreatedAt,
                    ])
                    .to_owned(),
            )
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn delete_by_job<C: ConnectionTrait>(
        db: &C,
        job_id: &str,
    ) -> Result<u64, sea_orm::DbErr> {
        let res = RunFingerprint::delete_many()
            .filter(run_fingerprint::Column::JobId.eq(job_id))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }
}
