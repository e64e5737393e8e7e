use crate::app_state::AppEvent;
use crate::backtest::cancel::CancelRegistry;
use crate::backtest::extractor::{CommandExtractor, ResultExtractor};
use crate::backtest::files::{self, EXTRACTED_FILE, LOG_FILE, RESULT_FILE, STRATEGY_FILE};
use crate::backtest::fingerprint::{build_run_fingerprint, code_sha256};
use crate::backtest::model::{
    JobError, JobMeta, JobPage, JobStats, JobStatus, JobSummary, LogSlice, LogWindow,
    ResultDocument, RunParams, RunRequest, StatusRecord, SubmitOutcome, ERR_EXIT_NONZERO,
    ERR_INTERNAL, ERR_RESULT_MISSING, ERR_TIMEOUT, MAX_LIST_LIMIT, MAX_LOG_TAIL,
};
use crate::backtest::worker::{BacktestLauncher, ProcessExit, RqalphaLauncher};
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::storage::entity::job_index;
use crate::storage::repository::{FingerprintRepository, JobIndexRepository, NewJob};
use crate::strategy::graph::RenameGraph;
use crate::strategy::id::normalize_strategy_id;
use crate::strategy::source::CodeSource;
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{error, info, warn};
use sea_orm::DatabaseConnection;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

const RESTART_MESSAGE: &str = "job interrupted by service restart; see run.log";

/// 回测任务编排：建目录、起进程、驱动状态机、维护索引
#[derive(Clone)]
pub struct BacktestService {
    db: Arc<DatabaseConnection>,
    config: Arc<Config>,
    graph: Arc<RenameGraph>,
    code_source: Arc<dyn CodeSource>,
    launcher: Arc<dyn BacktestLauncher>,
    extractor: Arc<dyn ResultExtractor>,
    cancels: Arc<CancelRegistry>,
    // 指纹查重 + 建任务在同一把锁内完成，并发的重复提交只会产生一个任务
    submit_lock: Arc<Mutex<()>>,
    evt_tx: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl BacktestService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<Config>,
        graph: Arc<RenameGraph>,
        code_source: Arc<dyn CodeSource>,
    ) -> Self {
        let launcher = Arc::new(RqalphaLauncher::from_config(&config));
        let extractor = Arc::new(CommandExtractor::from_config(&config));
        Self {
            db,
            config,
            graph,
            code_source,
            launcher,
            extractor,
            cancels: Arc::new(CancelRegistry::new()),
            submit_lock: Arc::new(Mutex::new(())),
            evt_tx: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn BacktestLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ResultExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_events(mut self, evt_tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        self.evt_tx = Some(evt_tx);
        self
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    fn emit(&self, msg: String) {
        if let Some(tx) = &self.evt_tx {
            let _ = tx.send(AppEvent::Log(msg));
        }
    }

    /// 提交回测。任务落盘并入索引后立即返回，执行在独立 task 中进行。
    pub async fn submit(&self, req: &RunRequest) -> ServiceResult<SubmitOutcome> {
        let (strategy_id, params) = req.validate(&self.config.allowed_frequencies)?;
        let strategy_id = self.graph.resolve(&strategy_id).await?;
        let code = self
            .code_source
            .load(&strategy_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("strategy not found"))?;
        let fingerprint = build_run_fingerprint(&strategy_id, &params, &code);

        let _guard = self.submit_lock.lock().await;

        if let Some(job_id) = self.find_reusable(&fingerprint).await? {
            info!("命中幂等窗口，复用任务 [{}]", job_id);
            return Ok(SubmitOutcome {
                job_id,
                reused: true,
            });
        }

        if let Err(e) = self.cleanup_old_runs().await {
            warn!("清理过期任务失败: {:#}", e);
        }

        let (job_id, job_dir) = files::create_job_dir(&self.config.runs_dir()).await?;
        if let Err(e) = self
            .prepare_job(&job_id, &job_dir, &strategy_id, &params, &code, &fingerprint)
            .await
        {
            if let Err(rm) = tokio::fs::remove_dir_all(&job_dir).await {
                warn!("清理未完成的任务目录失败 {}: {}", job_dir.display(), rm);
            }
            let _ = JobIndexRepository::delete(self.db.as_ref(), &job_id).await;
            return Err(e);
        }

        info!("🚀 已创建回测任务 [{}] 策略: {}", job_id, strategy_id);
        self.emit(format!("已创建回测任务 [{}]: {}", job_id, strategy_id));
        tokio::spawn(self.clone().run_job(job_id.clone(), job_dir));

        Ok(SubmitOutcome {
            job_id,
            reused: false,
        })
    }

    async fn find_reusable(&self, fingerprint: &str) -> ServiceResult<Option<String>> {
        let window_ms = self.config.idempotency_window.as_millis() as i64;
        if window_ms <= 0 {
            return Ok(None);
        }
        let Some(row) = FingerprintRepository::find(self.db.as_ref(), fingerprint).await? else {
            return Ok(None);
        };
        if Utc::now().timestamp_millis() - row.created_at >= window_ms {
            return Ok(None);
        }
        // 已删除的任务不能复用
        let indexed = JobIndexRepository::find(self.db.as_ref(), &row.job_id).await?;
        Ok(indexed.map(|r| r.job_id))
    }

    async fn prepare_job(
        &self,
        job_id: &str,
        job_dir: &Path,
        strategy_id: &str,
        params: &RunParams,
        code: &str,
        fingerprint: &str,
    ) -> ServiceResult<()> {
        files::write_atomic(&job_dir.join(STRATEGY_FILE), code.as_bytes()).await?;
        let output_file = std::path::absolute(job_dir.join(RESULT_FILE))?;
        let yaml = files::build_config_yaml(params, &self.config.bundle_path, &output_file)?;
        files::write_atomic(&job_dir.join(files::CONFIG_FILE), yaml.as_bytes()).await?;

        files::write_status(job_dir, JobStatus::Queued, None).await?;
        let meta = JobMeta {
            strategy_id: strategy_id.to_string(),
            params: params.clone(),
            code_sha256: code_sha256(code),
        };
        files::write_meta(job_dir, &meta).await?;

        let created_at = Utc::now().timestamp_millis();
        JobIndexRepository::insert(
            self.db.as_ref(),
            NewJob {
                job_id,
                strategy_id,
                params_json: serde_json::to_string(params)?,
                job_dir: job_dir.display().to_string(),
                created_at,
            },
        )
        .await?;
        FingerprintRepository::bind(self.db.as_ref(), fingerprint, job_id, created_at).await?;
        Ok(())
    }

    /// 单个任务的监督入口：无论成功、出错还是 panic，最后都清掉取消标记
    async fn run_job(self, job_id: String, job_dir: PathBuf) {
        let cancel = self.cancels.subscribe(&job_id);
        let outcome = AssertUnwindSafe(self.execute(&job_id, &job_dir, cancel))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
        };
        if let Some(message) = failure {
            error!("任务 [{}] 内部错误: {}", job_id, message);
            let err = JobError::new(ERR_INTERNAL, message);
            if let Err(e) = self
                .transition(&job_id, &job_dir, JobStatus::Failed, Some(err))
                .await
            {
                error!("任务 [{}] 写入失败状态出错: {:#}", job_id, e);
            }
        }

        self.cancels.clear(&job_id);
    }

    async fn execute(
        &self,
        job_id: &str,
        job_dir: &Path,
        cancel: Arc<Notify>,
    ) -> anyhow::Result<()> {
        if self.cancels.is_requested(job_id) {
            info!("任务 [{}] 启动前已取消", job_id);
            return self
                .transition(job_id, job_dir, JobStatus::Cancelled, Some(JobError::cancelled()))
                .await;
        }

        self.transition(job_id, job_dir, JobStatus::Running, None)
            .await?;
        let timeout = self.config.timeout;
        let exit = self.launcher.launch(job_dir, timeout, cancel).await?;

        let (status, error) = match exit {
            ProcessExit::TimedOut => (
                JobStatus::Failed,
                Some(JobError::new(
                    ERR_TIMEOUT,
                    format!("rqalpha timeout after {}s; see run.log", timeout.as_secs()),
                )),
            ),
            ProcessExit::Exited(code)
                if code == Some(self.config.cancelled_exit_code)
                    || self.cancels.is_requested(job_id) =>
            {
                (JobStatus::Cancelled, Some(JobError::cancelled()))
            }
            ProcessExit::Exited(code) if code != Some(0) => {
                let code = code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                (
                    JobStatus::Failed,
                    Some(JobError::new(
                        ERR_EXIT_NONZERO,
                        format!("rqalpha exit code={}; see run.log", code),
                    )),
                )
            }
            ProcessExit::Exited(_) => {
                let result = job_dir.join(RESULT_FILE);
                if !tokio::fs::try_exists(&result).await.unwrap_or(false) {
                    (
                        JobStatus::Failed,
                        Some(JobError::new(
                            ERR_RESULT_MISSING,
                            "result.pkl not found; check sys_analyser.output_file",
                        )),
                    )
                } else {
                    let limit = self.config.extract_timeout;
                    let doc = match tokio::time::timeout(limit, self.extractor.extract(&result))
                        .await
                    {
                        Ok(doc) => doc.context("extract result")?,
                        Err(_) => anyhow::bail!(
                            "result extraction timeout after {}s",
                            limit.as_secs()
                        ),
                    };
                    files::write_json_atomic(&job_dir.join(EXTRACTED_FILE), &doc).await?;
                    (JobStatus::Finished, None)
                }
            }
        };
        self.transition(job_id, job_dir, status, error).await
    }

    /// 写 status.json 并同步索引。非法迁移（如终态之后）直接忽略。
    async fn transition(
        &self,
        job_id: &str,
        job_dir: &Path,
        next: JobStatus,
        error: Option<JobError>,
    ) -> anyhow::Result<()> {
        if !tokio::fs::try_exists(job_dir).await.unwrap_or(false) {
            info!("任务 [{}] 目录已删除，跳过状态 {}", job_id, next);
            return Ok(());
        }
        if let Ok(current) = files::read_status(job_dir).await {
            if !current.status.can_transition_to(next) {
                warn!(
                    "任务 [{}] 忽略状态迁移 {} -> {}",
                    job_id, current.status, next
                );
                return Ok(());
            }
        }
        files::write_status(job_dir, next, error.clone()).await?;
        JobIndexRepository::update_status(
            self.db.as_ref(),
            job_id,
            next,
            error.as_ref().map(|e| e.code.clone()),
            error.as_ref().map(|e| e.message.clone()),
            Utc::now().timestamp_millis(),
        )
        .await?;

        match &error {
            Some(e) => info!("任务 [{}] -> {} ({}: {})", job_id, next, e.code, e.message),
            None => info!("任务 [{}] -> {}", job_id, next),
        }
        if next.is_terminal() {
            self.emit(format!("任务 [{}] 结束: {}", job_id, next));
        }
        Ok(())
    }

    /// 请求取消。标记写入后由任务自己在检查点上处理；已结束的任务不保留标记。
    pub async fn cancel(&self, job_id: &str) -> ServiceResult<StatusRecord> {
        let job_dir = self.locate_job_dir(job_id).await?;
        let current = self.read_status_of(&job_dir).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        self.cancels.request_cancel(job_id);
        info!("已请求取消任务 [{}]", job_id);

        let after = self.read_status_of(&job_dir).await?;
        if after.status.is_terminal() {
            self.cancels.clear(job_id);
        }
        Ok(after)
    }

    pub async fn job_status(&self, job_id: &str) -> ServiceResult<StatusRecord> {
        let job_dir = self.locate_job_dir(job_id).await?;
        self.read_status_of(&job_dir).await
    }

    async fn read_status_of(&self, job_dir: &Path) -> ServiceResult<StatusRecord> {
        files::read_status(job_dir).await.map_err(|e| {
            warn!("读取状态失败 {}: {:#}", job_dir.display(), e);
            ServiceError::not_found("status not found")
        })
    }

    /// 只有 FINISHED 的任务有结果；`page` 为 `(page, page_size)`
    pub async fn job_result(
        &self,
        job_id: &str,
        page: Option<(usize, usize)>,
    ) -> ServiceResult<ResultDocument> {
        let job_dir = self.locate_job_dir(job_id).await?;
        let status = self.read_status_of(&job_dir).await?;
        if status.status != JobStatus::Finished {
            return Err(ServiceError::ResultNotReady {
                status: status.status.to_string(),
                detail: status.error.map(|e| e.message),
            });
        }

        let path = job_dir.join(EXTRACTED_FILE);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| ServiceError::internal(format!("result file missing {}: {}", path.display(), e)))?;
        let payload: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| ServiceError::internal(format!("result file is invalid {}: {}", path.display(), e)))?;

        let mut doc = ResultDocument::from_value(&payload);
        if let Some((page, page_size)) = page {
            doc.paginate(page, page_size)?;
        }
        Ok(doc)
    }

    pub async fn job_log(&self, job_id: &str, window: LogWindow) -> ServiceResult<LogSlice> {
        if let LogWindow::Tail(n) = window {
            if n < 1 {
                return Err(ServiceError::invalid("tail must be >= 1"));
            }
            if n > MAX_LOG_TAIL {
                return Err(ServiceError::invalid(format!(
                    "tail must be <= {}",
                    MAX_LOG_TAIL
                )));
            }
        }
        let job_dir = self.locate_job_dir(job_id).await?;
        let path = job_dir.join(LOG_FILE);
        match files::read_log_slice(&path, window).await {
            Ok(slice) => Ok(slice),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::not_found("log not found"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn locate_job_dir(&self, job_id: &str) -> ServiceResult<PathBuf> {
        if !files::is_safe_job_id(job_id) {
            return Err(ServiceError::not_found("job not found"));
        }
        if let Some(row) = JobIndexRepository::find(self.db.as_ref(), job_id).await? {
            let dir = PathBuf::from(&row.job_dir);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                return Ok(dir);
            }
        }
        files::find_job_dir(&self.config.runs_dir(), job_id)
            .await
            .ok_or_else(|| ServiceError::not_found("job not found"))
    }

    /// 列出策略（含全部别名）下的任务，按更新时间倒序
    pub async fn list_jobs_for_strategy(
        &self,
        strategy_id: &str,
        limit: u64,
        offset: u64,
        status: Option<&str>,
    ) -> ServiceResult<JobPage> {
        if limit < 1 {
            return Err(ServiceError::invalid("limit must be >= 1"));
        }
        if limit > MAX_LIST_LIMIT {
            return Err(ServiceError::invalid(format!(
                "limit must be <= {}",
                MAX_LIST_LIMIT
            )));
        }
        let status_filter = match status.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse::<JobStatus>()?),
            None => None,
        };

        let canonical = self.graph.resolve(&normalize_strategy_id(strategy_id)?).await?;
        let mut jobs = self.collect_strategy_jobs(&canonical).await?;
        if let Some(filter) = status_filter {
            jobs.retain(|j| j.status == filter.as_str());
        }
        jobs.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });

        let total = jobs.len();
        let jobs = jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(JobPage {
            strategy_id: canonical,
            jobs,
            total,
        })
    }

    /// 引用该策略（含别名）的全部任务 id，已排序
    pub async fn strategy_job_ids(&self, canonical: &str) -> ServiceResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .collect_strategy_jobs(canonical)
            .await?
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn collect_strategy_jobs(&self, canonical: &str) -> ServiceResult<Vec<JobSummary>> {
        let aliases = self.graph.aliases(canonical).await?;
        let alias_set: HashSet<&str> = aliases.iter().map(String::as_str).collect();
        let rows =
            JobIndexRepository::find_by_strategies_or_unknown(self.db.as_ref(), &aliases).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let indexed_sid = row.strategy_id.clone().filter(|s| !s.is_empty());
            let mut params = row
                .params_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<RunParams>(raw).ok());

            let strategy_id = match indexed_sid {
                Some(sid) => sid,
                None => {
                    // 旧索引行没有 strategy_id，回读 meta.json
                    let Some(meta) = files::read_meta(Path::new(&row.job_dir)).await else {
                        continue;
                    };
                    if params.is_none() {
                        params = Some(meta.params.clone());
                    }
                    meta.strategy_id
                }
            };
            if !alias_set.contains(strategy_id.as_str()) {
                continue;
            }
            out.push(summary_from_row(row, strategy_id, params));
        }
        Ok(out)
    }

    /// 删除任务目录、索引与指纹。运行中的任务先请求取消。
    pub async fn delete_job(&self, job_id: &str) -> ServiceResult<()> {
        if !files::is_safe_job_id(job_id) {
            return Err(ServiceError::not_found("job not found"));
        }
        let row = JobIndexRepository::find(self.db.as_ref(), job_id).await?;
        let job_dir = match &row {
            Some(r) => Some(PathBuf::from(&r.job_dir)),
            None => files::find_job_dir(&self.config.runs_dir(), job_id).await,
        };
        if row.is_none() && job_dir.is_none() {
            return Err(ServiceError::not_found("job not found"));
        }

        let live = row
            .as_ref()
            .and_then(|r| r.status.parse::<JobStatus>().ok())
            .map(|s| !s.is_terminal())
            .unwrap_or(false);
        if live {
            self.cancels.request_cancel(job_id);
        }

        if let Some(dir) = &job_dir {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        JobIndexRepository::delete(self.db.as_ref(), job_id).await?;
        FingerprintRepository::delete_by_job(self.db.as_ref(), job_id).await?;
        info!("✓ 已删除任务 [{}]", job_id);
        Ok(())
    }

    /// 删除 keep_days 之前日期分区中已结束的任务，返回删除数量
    pub async fn cleanup_old_runs(&self) -> anyhow::Result<usize> {
        if self.config.keep_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.config.keep_days);
        let mut removed = 0;

        for (date, date_dir) in files::list_date_dirs(&self.config.runs_dir()).await? {
            if date >= cutoff {
                break;
            }
            let mut entries = tokio::fs::read_dir(&date_dir).await?;
            let mut kept = 0;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(job_id) = entry.file_name().to_str().map(|s| s.to_string()) else {
                    kept += 1;
                    continue;
                };
                let live = files::read_status(&path)
                    .await
                    .map(|r| !r.status.is_terminal())
                    .unwrap_or(false);
                if live || !entry.file_type().await?.is_dir() {
                    kept += 1;
                    continue;
                }
                tokio::fs::remove_dir_all(&path)
                    .await
                    .with_context(|| format!("remove {}", path.display()))?;
                JobIndexRepository::delete(self.db.as_ref(), &job_id).await?;
                FingerprintRepository::delete_by_job(self.db.as_ref(), &job_id).await?;
                removed += 1;
            }
            if kept == 0 {
                let _ = tokio::fs::remove_dir(&date_dir).await;
            }
        }

        if removed > 0 {
            info!("✓ 清理过期任务 {} 个", removed);
        }
        Ok(removed)
    }

    /// 启动时调用：上一进程遗留的 QUEUED/RUNNING 任务标记为失败
    pub async fn recover(&self) -> ServiceResult<u64> {
        info!("正在执行回测任务恢复程序...");
        let live = JobIndexRepository::find_live(self.db.as_ref()).await?;
        for row in &live {
            let dir = Path::new(&row.job_dir);
            let err = JobError::new(ERR_INTERNAL, RESTART_MESSAGE);
            if let Err(e) = files::write_status(dir, JobStatus::Failed, Some(err)).await {
                warn!("恢复任务 [{}] 写状态失败: {:#}", row.job_id, e);
            }
        }
        let count =
            JobIndexRepository::fail_live_jobs(self.db.as_ref(), ERR_INTERNAL, RESTART_MESSAGE)
                .await?;
        if count > 0 {
            info!("✓ 系统恢复: {} 个中断的任务标记为失败", count);
            self.emit(format!("系统恢复: {} 个中断的任务标记为失败", count));
        } else {
            info!("未发现需要恢复的任务");
        }
        Ok(count)
    }

    pub async fn stats(&self) -> ServiceResult<JobStats> {
        Ok(JobIndexRepository::get_stats(self.db.as_ref()).await?)
    }
}

fn summary_from_row(
    row: job_index::Model,
    strategy_id: String,
    params: Option<RunParams>,
) -> JobSummary {
    let error = row.error_code.map(|code| JobError {
        code,
        message: row.error_message.unwrap_or_default(),
    });
    JobSummary {
        job_id: row.job_id,
        strategy_id: Some(strategy_id),
        status: row.status,
        created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
        updated_at: DateTime::from_timestamp_millis(row.updated_at).unwrap_or_default(),
        params,
        error,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
