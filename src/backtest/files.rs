//! 任务目录布局：`runs/<YYYY-MM-DD>/<job_id>/`
//!
//! 目录内文件：`strategy.py`、`config.yml`、`status.json`、`meta.json`、
//! `run.log`、`result.pkl`、`extracted.json`。所有 JSON 都先写临时文件再 rename。

use crate::backtest::model::{
    cash_value, JobError, JobMeta, JobStatus, LogSlice, LogWindow, RunParams, StatusRecord,
};
use anyhow::Context;
use chrono::{NaiveDate, SecondsFormat, Utc};
use log::warn;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const STRATEGY_FILE: &str = "strategy.py";
pub const CONFIG_FILE: &str = "config.yml";
pub const STATUS_FILE: &str = "status.json";
pub const META_FILE: &str = "meta.json";
pub const LOG_FILE: &str = "run.log";
pub const RESULT_FILE: &str = "result.pkl";
pub const EXTRACTED_FILE: &str = "extracted.json";

const DATE_DIR_FORMAT: &str = "%Y-%m-%d";

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_job_id() -> String {
    format!(
        "{}_{:08x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u32>()
    )
}

/// 任务 id 只会由 `new_job_id` 生成，外部传入的 id 先过这一关再拼路径
pub fn is_safe_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 64
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 在当天的日期目录下创建新任务目录
pub async fn create_job_dir(runs_dir: &Path) -> anyhow::Result<(String, PathBuf)> {
    let date_dir = runs_dir.join(Utc::now().format(DATE_DIR_FORMAT).to_string());
    tokio::fs::create_dir_all(&date_dir)
        .await
        .with_context(|| format!("create {}", date_dir.display()))?;
    loop {
        let job_id = new_job_id();
        let job_dir = date_dir.join(&job_id);
        match tokio::fs::create_dir(&job_dir).await {
            Ok(()) => return Ok((job_id, job_dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create {}", job_dir.display()));
            }
        }
    }
}

pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("target path has no file name")?;
    let tmp = path.with_file_name(format!(".{}.{:08x}.tmp", name, rand::random::<u32>()));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("rename to {}", path.display()));
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

pub async fn write_status(
    job_dir: &Path,
    status: JobStatus,
    error: Option<JobError>,
) -> anyhow::Result<StatusRecord> {
    let record = StatusRecord {
        status,
        updated_at: now_rfc3339(),
        error,
    };
    write_json_atomic(&job_dir.join(STATUS_FILE), &record).await?;
    Ok(record)
}

pub async fn read_status(job_dir: &Path) -> anyhow::Result<StatusRecord> {
    let path = job_dir.join(STATUS_FILE);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

pub async fn write_meta(job_dir: &Path, meta: &JobMeta) -> anyhow::Result<()> {
    write_json_atomic(&job_dir.join(META_FILE), meta).await
}

/// 读不到或格式不对时返回 None
pub async fn read_meta(job_dir: &Path) -> Option<JobMeta> {
    let path = job_dir.join(META_FILE);
    let raw = tokio::fs::read(&path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!("meta 文件格式错误 {}: {}", path.display(), e);
            None
        }
    }
}

#[derive(Serialize)]
struct EngineConfig {
    base: BaseSection,
    extra: ExtraSection,
    #[serde(rename = "mod")]
    mods: ModSection,
}

#[derive(Serialize)]
struct BaseSection {
    start_date: String,
    end_date: String,
    frequency: String,
    accounts: Accounts,
    data_bundle_path: String,
}

#[derive(Serialize)]
struct Accounts {
    stock: Value,
}

#[derive(Serialize)]
struct ExtraSection {
    log_level: String,
}

#[derive(Serialize)]
struct ModSection {
    sys_analyser: AnalyserSection,
}

#[derive(Serialize)]
struct AnalyserSection {
    enabled: bool,
    benchmark: String,
    output_file: String,
}

/// rqalpha 的 config.yml
pub fn build_config_yaml(
    params: &RunParams,
    bundle_path: &Path,
    output_file: &Path,
) -> anyhow::Result<String> {
    let cfg = EngineConfig {
        base: BaseSection {
            start_date: params.start_date.to_string(),
            end_date: params.end_date.to_string(),
            frequency: params.frequency.clone(),
            accounts: Accounts {
                stock: cash_value(params.cash),
            },
            data_bundle_path: bundle_path.display().to_string(),
        },
        extra: ExtraSection {
            log_level: "info".to_string(),
        },
        mods: ModSection {
            sys_analyser: AnalyserSection {
                enabled: true,
                benchmark: params.benchmark.clone(),
                output_file: output_file.display().to_string(),
            },
        },
    };
    Ok(serde_yaml::to_string(&cfg)?)
}

pub async fn read_log_slice(path: &Path, window: LogWindow) -> std::io::Result<LogSlice> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let start = match window {
        LogWindow::Full => 0,
        LogWindow::Offset(offset) => offset.min(size),
        LogWindow::Tail(n) => size.saturating_sub(n),
    };
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).await?;
    let next_offset = start + data.len() as u64;
    Ok(LogSlice {
        content: String::from_utf8_lossy(&data).into_owned(),
        offset: start,
        next_offset,
        size,
    })
}

/// 所有日期分区目录，按日期升序。无法解析的目录名忽略。
pub async fn list_date_dirs(runs_dir: &Path) -> std::io::Result<Vec<(NaiveDate, PathBuf)>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(runs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(date) = NaiveDate::parse_from_str(name, DATE_DIR_FORMAT) {
            if entry.file_type().await?.is_dir() {
                out.push((date, entry.path()));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// 索引里没有记录时，按日期目录扫描
pub async fn find_job_dir(runs_dir: &Path, job_id: &str) -> Option<PathBuf> {
    if !is_safe_job_id(job_id) {
        return None;
    }
    let dirs = list_date_dirs(runs_dir).await.ok()?;
    for (_, date_dir) in dirs.into_iter().rev() {
        let candidate = date_dir.join(job_id);
        if tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Some(candidate);
        }
    }
    None
}
