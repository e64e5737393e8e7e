use crate::backtest::BacktestService;
use crate::error::{ConflictError, ServiceError, ServiceResult};
use crate::strategy::compile::{CompileReport, PythonChecker, StrategyChecker};
use crate::strategy::graph::{RenameGraph, UpsertOutcome};
use crate::strategy::id::{normalize_field, normalize_strategy_id};
use crate::strategy::rename::{self, RenameMap, NOOP_ALREADY_APPLIED, NOOP_SAME_ID};
use crate::strategy::source::{CodeSource, StrategyMeta};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameOutcome {
    pub from_id: String,
    pub to_id: String,
    pub deleted_old: bool,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub strategy_id: String,
    pub deleted_jobs: usize,
}

pub const DEFAULT_STRATEGY_LIMIT: u64 = 100;
pub const MAX_STRATEGY_LIMIT: u64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyPage {
    pub strategies: Vec<StrategyMeta>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyDetail {
    #[serde(flatten)]
    pub meta: StrategyMeta,
    pub code: String,
}

/// 策略身份相关操作：源码存取、列表、编译检查、改名、删除
#[derive(Clone)]
pub struct StrategyService {
    graph: Arc<RenameGraph>,
    code_source: Arc<dyn CodeSource>,
    jobs: BacktestService,
    checker: Arc<dyn StrategyChecker>,
}

impl StrategyService {
    pub fn new(
        graph: Arc<RenameGraph>,
        code_source: Arc<dyn CodeSource>,
        jobs: BacktestService,
    ) -> Self {
        Self {
            graph,
            code_source,
            jobs,
            checker: Arc::new(PythonChecker::default()),
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn StrategyChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub async fn resolve(&self, strategy_id: &str) -> ServiceResult<String> {
        let id = normalize_strategy_id(strategy_id)?;
        self.graph.resolve(&id).await
    }

    /// 按当前 id 保存源码，返回写入后的元数据
    pub async fn save_strategy(&self, strategy_id: &str, code: &str) -> ServiceResult<StrategyMeta> {
        if code.trim().is_empty() {
            return Err(ServiceError::invalid("code is empty"));
        }
        let canonical = self.resolve(strategy_id).await?;
        self.code_source.save(&canonical, code).await?;
        info!("✓ 策略已保存: {}", canonical);
        self.code_source
            .metadata(&canonical)
            .await?
            .ok_or_else(|| ServiceError::internal(format!("strategy {} vanished after save", canonical)))
    }

    pub async fn load_strategy(&self, strategy_id: &str) -> ServiceResult<(String, String)> {
        let canonical = self.resolve(strategy_id).await?;
        match self.code_source.load(&canonical).await? {
            Some(code) => Ok((canonical, code)),
            None => Err(ServiceError::not_found("strategy not found")),
        }
    }

    /// 元数据加源码
    pub async fn load_strategy_detail(&self, strategy_id: &str) -> ServiceResult<StrategyDetail> {
        let (canonical, code) = self.load_strategy(strategy_id).await?;
        let meta = self
            .code_source
            .metadata(&canonical)
            .await?
            .ok_or_else(|| ServiceError::not_found("strategy not found"))?;
        Ok(StrategyDetail { meta, code })
    }

    /// 按更新时间倒序列出策略；`q` 为 id 子串过滤（不区分大小写）
    pub async fn list_strategies(
        &self,
        q: Option<&str>,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<StrategyPage> {
        if limit < 1 {
            return Err(ServiceError::invalid("limit must be >= 1"));
        }
        if limit > MAX_STRATEGY_LIMIT {
            return Err(ServiceError::invalid(format!(
                "limit must be <= {}",
                MAX_STRATEGY_LIMIT
            )));
        }
        let needle = q
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut items = self.code_source.list().await?;
        if let Some(needle) = &needle {
            items.retain(|m| m.id.to_lowercase().contains(needle.as_str()));
        }
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        let total = items.len();
        let strategies = items
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(StrategyPage { strategies, total })
    }

    /// 语法与依赖检查。给出非空的临时源码时只检查它，不写入存储。
    pub async fn compile_strategy(
        &self,
        strategy_id: &str,
        code: Option<&str>,
    ) -> ServiceResult<CompileReport> {
        let canonical = self.resolve(strategy_id).await?;
        let code = match code.filter(|c| !c.trim().is_empty()) {
            Some(code) => code.to_string(),
            None => self
                .code_source
                .load(&canonical)
                .await?
                .ok_or_else(|| ServiceError::invalid("strategy code not found"))?,
        };

        let report = match self.checker.check(&code).await {
            Ok(out) => CompileReport::from_check(out),
            Err(e) => {
                warn!("策略 {} 编译检查失败: {:#}", canonical, e);
                CompileReport::internal(format!("{:#}", e))
            }
        };
        info!(
            "策略 {} 编译检查: {} ({} 条诊断)",
            canonical,
            report.kind,
            report.diagnostics.len()
        );
        Ok(report)
    }

    pub async fn rename_map(&self) -> ServiceResult<RenameMap> {
        self.graph.map().await
    }

    /// 只写映射，不动源码
    pub async fn upsert_mapping(
        &self,
        from_id: &str,
        to_id: &str,
        updated_by: Option<&str>,
    ) -> ServiceResult<UpsertOutcome> {
        self.graph.upsert(from_id, to_id, updated_by).await
    }

    /// 改名：源码搬到新 id，写入映射，删除旧文件
    pub async fn rename_strategy(
        &self,
        from_id: &str,
        to_id: &str,
        code_override: Option<&str>,
        updated_by: Option<&str>,
    ) -> ServiceResult<RenameOutcome> {
        let from_id = normalize_field(from_id, "from_id")?;
        let to_id = normalize_field(to_id, "to_id")?;
        let noop = |warning: &str| RenameOutcome {
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            deleted_old: false,
            warning: Some(warning.to_string()),
        };

        if from_id == to_id {
            return Ok(noop(NOOP_SAME_ID));
        }

        // 从检查到写映射全程持有写锁，并发改名不会互相覆盖
        let guard = self.graph.lock_writes().await;
        let map = self.graph.map().await?;
        let canonical_from = rename::resolve(&map, &from_id);
        if canonical_from == to_id {
            return Ok(noop(NOOP_ALREADY_APPLIED));
        }
        if rename::would_create_cycle(&map, &canonical_from, &to_id) {
            return Err(ConflictError::RenameCycle {
                from_id: from_id.clone(),
                to_id: to_id.clone(),
            }
            .into());
        }
        // 目标已是别名时，它的源码在别的 id 下
        if map.contains_key(&to_id) {
            return Err(ConflictError::RenameConflict { to_id }.into());
        }

        let code = match code_override {
            Some(code) => code.to_string(),
            None => self
                .code_source
                .load(&canonical_from)
                .await?
                .ok_or_else(|| ServiceError::not_found("strategy not found"))?,
        };
        if self.code_source.exists(&to_id).await? {
            return Err(ConflictError::RenameConflict { to_id }.into());
        }

        self.code_source.save(&to_id, &code).await?;
        let outcome = match self
            .graph
            .upsert_locked(&guard, &canonical_from, &to_id, updated_by)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // 映射失败时撤回新文件
                if let Err(del) = self.code_source.delete(&to_id).await {
                    warn!("回滚改名时删除 {} 失败: {:#}", to_id, del);
                }
                return Err(e);
            }
        };

        let deleted_old = match self.code_source.delete(&canonical_from).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("删除旧策略文件 {} 失败: {:#}", canonical_from, e);
                false
            }
        };
        drop(guard);
        info!("✓ 策略改名: {} -> {}", canonical_from, to_id);

        Ok(RenameOutcome {
            from_id,
            to_id,
            deleted_old,
            warning: outcome.warning.map(|w| w.to_string()),
        })
    }

    /// 删除策略。`cascade` 时连同全部别名下的任务和映射一起删除。
    pub async fn delete_strategy(
        &self,
        strategy_id: &str,
        cascade: bool,
    ) -> ServiceResult<DeleteOutcome> {
        let canonical = self.resolve(strategy_id).await?;
        let job_ids = self.jobs.strategy_job_ids(&canonical).await?;

        if !cascade {
            if !job_ids.is_empty() {
                return Err(ConflictError::StrategyReferenced {
                    strategy_id: canonical,
                    job_ids,
                }
                .into());
            }
            if !self.code_source.delete(&canonical).await? {
                return Err(ServiceError::not_found("strategy not found"));
            }
            info!("✓ 策略已删除: {}", canonical);
            return Ok(DeleteOutcome {
                strategy_id: canonical,
                deleted_jobs: 0,
            });
        }

        let map = self.graph.map().await?;
        let has_edges = map
            .iter()
            .any(|(from, to)| *from == canonical || *to == canonical);
        let has_code = self.code_source.exists(&canonical).await?;
        if job_ids.is_empty() && !has_edges && !has_code {
            return Err(ServiceError::not_found("strategy not found"));
        }

        let mut deleted_jobs = 0;
        for job_id in &job_ids {
            match self.jobs.delete_job(job_id).await {
                Ok(()) => deleted_jobs += 1,
                Err(ServiceError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.graph.remove_strategy(&canonical).await?;
        self.code_source.delete(&canonical).await?;
        info!(
            "✓ 策略级联删除: {}，删除任务 {} 个",
            canonical, deleted_jobs
        );

        Ok(DeleteOutcome {
            strategy_id: canonical,
            deleted_jobs,
        })
    }
}
