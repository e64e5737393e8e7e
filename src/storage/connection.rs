use crate::storage::entity::{JobIndex, RunFingerprint, StrategyRename};
use log::info;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, Schema,
};
use std::time::Duration;

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    // 内存库只存在于单个连接里
    let max_connections = if db_url.contains(":memory:") { 1 } else { 10 };
    opt.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Info);

    let db = Database::connect(opt).await?;

    if db.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
        db.execute(sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
        db.execute(sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            "PRAGMA busy_timeout=5000;".to_string(),
        ))
        .await?;
    }

    create_table(&db, JobIndex).await?;
    create_table(&db, RunFingerprint).await?;
    create_table(&db, StrategyRename).await?;

    db.execute(sea_orm::Statement::from_string(
        db.get_database_backend(),
        "CREATE INDEX IF NOT EXISTS idx_job_index_strategy ON job_index(strategy_id, updated_at);"
            .to_string(),
    ))
    .await?;
    db.execute(sea_orm::Statement::from_string(
        db.get_database_backend(),
        "CREATE INDEX IF NOT EXISTS idx_run_fingerprints_job ON run_fingerprints(job_id);"
            .to_string(),
    ))
    .await?;

    info!("✓ 数据库连接成功，表结构已初始化");

    Ok(db)
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let stmt = builder.build(schema.create_table_from_entity(entity).if_not_exists());
    db.execute(stmt).await?;
    Ok(())
}
