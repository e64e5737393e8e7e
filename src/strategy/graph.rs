use crate::error::ServiceResult;
use crate::storage::repository::RenameRepository;
use crate::strategy::id::{is_valid_strategy_id, normalize_field};
use crate::strategy::rename::{self, RenameMap, RenamePlan};
use log::{info, warn};
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub map: RenameMap,
    pub warning: Option<&'static str>,
}

/// 持有期间其他写入方（upsert / remove_strategy / 改名）排队等待
pub struct GraphWriteGuard<'a> {
    _inner: MutexGuard<'a, ()>,
}

/// 策略改名图。库中只存 `旧 id -> 终点 id` 的直接边。
pub struct RenameGraph {
    db: Arc<DatabaseConnection>,
    // 进程内写锁，配合数据库事务保证整张边表的读改写不交错
    write_lock: Mutex<()>,
}

impl RenameGraph {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// 当前生效的映射：跳过非法行与自环，再压缩成一跳
    pub async fn map(&self) -> ServiceResult<RenameMap> {
        let stored = load_valid(self.db.as_ref()).await?;
        Ok(rename::compress(&stored))
    }

    /// 没有边时原样返回
    pub async fn resolve(&self, id: &str) -> ServiceResult<String> {
        let map = self.map().await?;
        Ok(rename::resolve(&map, id))
    }

    /// 所有最终指向 `canonical` 的 id（包含自身）
    pub async fn aliases(&self, canonical: &str) -> ServiceResult<Vec<String>> {
        let map = self.map().await?;
        Ok(rename::aliases(&map, canonical))
    }

    /// 拿到写锁。调用方需要把"检查 + 写入"作为一个整体时使用
    pub async fn lock_writes(&self) -> GraphWriteGuard<'_> {
        GraphWriteGuard {
            _inner: self.write_lock.lock().await,
        }
    }

    pub async fn upsert(
        &self,
        from_id: &str,
        to_id: &str,
        updated_by: Option<&str>,
    ) -> ServiceResult<UpsertOutcome> {
        let guard = self.lock_writes().await;
        self.upsert_locked(&guard, from_id, to_id, updated_by).await
    }

    /// 与 `upsert` 相同，但要求调用方已持有写锁
    pub async fn upsert_locked(
        &self,
        _guard: &GraphWriteGuard<'_>,
        from_id: &str,
        to_id: &str,
        updated_by: Option<&str>,
    ) -> ServiceResult<UpsertOutcome> {
        let from_id = normalize_field(from_id, "from_id")?;
        let to_id = normalize_field(to_id, "to_id")?;

        let txn = self.db.begin().await?;

        let stored = load_valid(&txn).await?;
        let current = rename::compress(&stored);
        let plan = rename::plan_upsert(&current, &from_id, &to_id)?;

        match plan {
            RenamePlan::Noop { warning, .. } => {
                txn.commit().await?;
                info!("改名映射无变化 [{} -> {}]: {}", from_id, to_id, warning);
                Ok(UpsertOutcome {
                    map: current,
                    warning: Some(warning),
                })
            }
            RenamePlan::Apply { edges, terminal } => {
                write_edges(&txn, &stored, &edges, updated_by).await?;
                txn.commit().await?;
                info!("✓ 改名映射已更新: {} -> {}", from_id, terminal);
                Ok(UpsertOutcome {
                    map: edges,
                    warning: None,
                })
            }
        }
    }

    /// 删除与 `canonical` 相关的全部边，返回删除后的映射
    pub async fn remove_strategy(&self, canonical: &str) -> ServiceResult<RenameMap> {
        let _guard = self.lock_writes().await;
        let txn = self.db.begin().await?;

        let stored = load_valid(&txn).await?;
        let next = rename::without_strategy(&rename::compress(&stored), canonical);
        write_edges(&txn, &stored, &next, None).await?;
        txn.commit().await?;
        Ok(next)
    }
}

async fn load_valid<C: ConnectionTrait>(db: &C) -> ServiceResult<RenameMap> {
    let rows = RenameRepository::load_rows(db).await?;
    let mut out = RenameMap::new();
    for row in rows {
        if !is_valid_strategy_id(&row.from_id) || !is_valid_strategy_id(&row.to_id) {
            warn!("跳过非法的改名映射行: {:?} -> {:?}", row.from_id, row.to_id);
            continue;
        }
        if row.from_id == row.to_id {
            continue;
        }
        out.insert(row.from_id, row.to_id);
    }
    Ok(out)
}

/// 把 `stored` 改写成 `target`。`stored` 之外的非法行保持原样。
async fn write_edges<C: ConnectionTrait>(
    db: &C,
    stored: &RenameMap,
    target: &RenameMap,
    updated_by: Option<&str>,
) -> ServiceResult<()> {
    let (upserts, deletes) = rename::diff(stored, target);
    for (from, to) in &upserts {
        RenameRepository::upsert_edge(db, from, to, updated_by).await?;
    }
    RenameRepository::delete_edges(db, &deletes).await?;
    Ok(())
}
