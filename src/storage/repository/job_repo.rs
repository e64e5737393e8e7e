use crate::backtest::model::{JobStats, JobStatus};
use crate::storage::entity::job_index::{self, ActiveModel as JobIndexActiveModel, Entity as JobIndex};
use chrono::Utc;
use log::warn;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};

/// 新任务入库时的字段
pub struct NewJob<'a> {
    pub job_id: &'a str,
    pub strategy_id: &'a str,
    pub params_json: String,
    pub job_dir: String,
    pub created_at: i64,
}

pub struct JobIndexRepository;

impl JobIndexRepository {
    pub async fn insert<C: ConnectionTrait>(db: &C, job: NewJob<'_>) -> Result<(), sea_orm::DbErr> {
        let active_model = JobIndexActiveModel {
            job_id: Set(job.job_id.to_string()),
            strategy_id: Set(Some(job.strategy_id.to_string())),
            status: Set(JobStatus::Queued.as_str().to_string()),
            created_at: Set(job.created_at),
            updated_at: Set(job.created_at),
            params_json: Set(Some(job.params_json)),
            error_code: Set(None),
            error_message: Set(None),
            job_dir: Set(job.job_dir),
        };
        active_model.insert(db).await?;
        Ok(())
    }

    /// 更新状态与错误信息；行不存在时只记录告警（任务可能已被删除）
    pub async fn update_status<C: ConnectionTrait>(
        db: &C,
        job_id: &str,
        status: JobStatus,
        error_code: Option<String>,
        error_message: Option<String>,
        updated_at: i64,
    ) -> Result<(), sea_orm::DbErr> {
        let res = JobIndex::update_many()
            .col_expr(job_index::Column::Status, Expr::value(status.as_str()))
            .col_expr(job_index::Column::ErrorCode, Expr::value(error_code))
            .col_expr(job_index::Column::ErrorMessage, Expr::value(error_message))
            .col_expr(job_index::Column::UpdatedAt, Expr::value(updated_at))
            .filter(job_index::Column::JobId.eq(job_id))
            .exec(db)
            .await?;
        if res.rows_affected == 0 {
            warn!("索引中不存在任务 [{}]，状态 {} 未写入索引", job_id, status.as_str());
        }
        Ok(())
    }

    pub async fn find<C: ConnectionTrait>(
        db: &C,
        job_id: &str,
    ) -> Result<Option<job_index::Model>, sea_orm::DbErr> {
        JobIndex::find_by_id(job_id.to_string()).one(db).await
    }

    /// 取出 strategy_id 属于 `ids` 的行，以及缺少 strategy_id 的旧行（由调用方回读 meta.json）
    pub async fn find_by_strategies_or_unknown<C: ConnectionTrait>(
        db: &C,
        ids: &[String],
    ) -> Result<Vec<job_index::Model>, sea_orm::DbErr> {
        JobIndex::find()
            .filter(
                job_index::Column::StrategyId
                    .is_in(ids.iter().cloned())
                    .or(job_index::Column::StrategyId.is_null())
                    .or(job_index::Column::StrategyId.eq("")),
            )
            .order_by_desc(job_index::Column::UpdatedAt)
            .all(db)
            .await
    }

    /// QUEUED / RUNNING 的任务
    pub async fn find_live<C: ConnectionTrait>(
        db: &C,
    ) -> Result<Vec<job_index::Model>, sea_orm::DbErr> {
        JobIndex::find()
            .filter(
                job_index::Column::Status
                    .eq(JobStatus::Queued.as_str())
                    .or(job_index::Column::Status.eq(JobStatus::Running.as_str())),
            )
            .all(db)
            .await
    }

    /// 启动恢复：把上一进程遗留的中间态统一标记为失败
    pub async fn fail_live_jobs<C: ConnectionTrait>(
        db: &C,
        error_code: &str,
        error_message: &str,
    ) -> Result<u64, sea_orm::DbErr> {
        let now = Utc::now().timestamp_millis();
        let res = JobIndex::update_many()
            .col_expr(job_index::Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(job_index::Column::ErrorCode, Expr::value(error_code))
            .col_expr(job_index::Column::ErrorMessage, Expr::value(error_message))
            .col_expr(job_index::Column::UpdatedAt, Expr::value(now))
            .filter(
                job_index::Column::Status
                    .eq(JobStatus::Queued.as_str())
                    .or(job_index::Column::Status.eq(JobStatus::Running.as_str())),
            )
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn delete<C: ConnectionTrait>(db: &C, job_id: &str) -> Result<bool, sea_orm::DbErr> {
        let res = JobIndex::delete_by_id(job_id.to_string()).exec(db).await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn get_stats<C: ConnectionTrait>(db: &C) -> Result<JobStats, sea_orm::DbErr> {
        let total = JobIndex::find().count(db).await? as usize;
        let queued = Self::count_status(db, JobStatus::Queued).await?;
        let running = Self::count_status(db, JobStatus::Running).await?;
        let finished = Self::count_status(db, JobStatus::Finished).await?;
        let failed = Self::count_status(db, JobStatus::Failed).await?;
        let cancelled = Self::count_status(db, JobStatus::Cancelled).await?;

        Ok(JobStats {
            total,
            queued,
            running,
            finished,
            failed,
            cancelled,
        })
    }

    async fn count_status<C: ConnectionTrait>(
        db: &C,
        status: JobStatus,
    ) -> Result<usize, sea_orm::DbErr> {
        let n = JobIndex::find()
            .filter(job_index::Column::Status.eq(status.as_str()))
            .count(db)
            .await?;
        Ok(n as usize)
    }
}
