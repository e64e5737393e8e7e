use crate::backtest::files::{write_atomic, write_json_atomic};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 策略文件的元数据。`created_at` 为空表示旧文件没有记录创建时间。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyMeta {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub size: u64,
}

/// 策略源码的存取
#[async_trait]
pub trait CodeSource: Send + Sync {
    async fn load(&self, strategy_id: &str) -> anyhow::Result<Option<String>>;
    async fn save(&self, strategy_id: &str, code: &str) -> anyhow::Result<()>;
    /// 返回是否确实删除了文件
    async fn delete(&self, strategy_id: &str) -> anyhow::Result<bool>;
    async fn metadata(&self, strategy_id: &str) -> anyhow::Result<Option<StrategyMeta>>;
    /// 全部已保存的策略，顺序不保证
    async fn list(&self) -> anyhow::Result<Vec<StrategyMeta>>;

    async fn exists(&self, strategy_id: &str) -> anyhow::Result<bool> {
        Ok(self.load(strategy_id).await?.is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    created_at: DateTime<Utc>,
}

/// `<dir>/<strategy_id>.py`，创建时间记在旁边的 `<strategy_id>.meta.json`。
/// 调用方保证 id 已通过校验。
pub struct FileCodeSource {
    dir: PathBuf,
}

impl FileCodeSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, strategy_id: &str) -> PathBuf {
        self.dir.join(format!("{}.py", strategy_id))
    }

    fn sidecar_of(&self, strategy_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", strategy_id))
    }

    async fn read_created_at(&self, strategy_id: &str) -> Option<DateTime<Utc>> {
        let path = self.sidecar_of(strategy_id);
        let raw = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<Sidecar>(&raw) {
            Ok(sidecar) => Some(sidecar.created_at),
            Err(e) => {
                warn!("策略元数据损坏 {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn meta_from_file(&self, strategy_id: &str, meta: std::fs::Metadata) -> StrategyMeta {
        let updated_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        StrategyMeta {
            id: strategy_id.to_string(),
            created_at: self.read_created_at(strategy_id).await,
            updated_at,
            size: meta.len(),
        }
    }
}

#[async_trait]
impl CodeSource for FileCodeSource {
    async fn load(&self, strategy_id: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_of(strategy_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(code) => Ok(Some(code)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn save(&self, strategy_id: &str, code: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {}", self.dir.display()))?;
        let is_new = !tokio::fs::try_exists(self.path_of(strategy_id)).await?;
        write_atomic(&self.path_of(strategy_id), code.as_bytes()).await?;
        // 覆盖保存不改创建时间；旧文件第一次覆盖时也不补记
        if is_new {
            let sidecar = Sidecar {
                created_at: Utc::now(),
            };
            write_json_atomic(&self.sidecar_of(strategy_id), &sidecar).await?;
        }
        Ok(())
    }

    async fn delete(&self, strategy_id: &str) -> anyhow::Result<bool> {
        let path = self.path_of(strategy_id);
        let deleted = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
        };
        match tokio::fs::remove_file(self.sidecar_of(strategy_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除策略元数据 {} 失败: {}", strategy_id, e),
        }
        Ok(deleted)
    }

    async fn metadata(&self, strategy_id: &str) -> anyhow::Result<Option<StrategyMeta>> {
        let path = self.path_of(strategy_id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(self.meta_from_file(strategy_id, meta).await)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<StrategyMeta>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.dir.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let Some(strategy_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if strategy_id.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(self.meta_from_file(strategy_id, meta).await);
        }
        Ok(out)
    }

    async fn exists(&self, strategy_id: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(self.path_of(strategy_id)).await?)
    }
}
