//! 行情数据 bundle 的就绪状态与下载进度

use crate::config::Config;
use chrono::{Datelike, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const REQUIRED_FILES: [&str; 3] = ["future_info.json", "instruments.pk", "trading_dates.npy"];
pub const TOTAL_BYTES_TTL: Duration = Duration::from_secs(10 * 60);

/// 带过期时间的单值缓存
pub struct TtlCache<T> {
    ttl: Duration,
    entry: Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<T> {
        self.get_at(Instant::now())
    }

    fn get_at(&self, now: Instant) -> Option<T> {
        let entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        match entry.as_ref() {
            Some((value, expires_at)) if now < *expires_at => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, value: T) {
        self.set_at(value, Instant::now());
    }

    fn set_at(&self, value: T, now: Instant) {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        *entry = Some((value, now + self.ttl));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleProgress {
    pub downloaded_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleStatus {
    pub ready: bool,
    pub status: String,
    pub message: String,
    pub progress: BundleProgress,
}

pub struct BundleProbe {
    bundle_path: PathBuf,
    status_file: PathBuf,
    bundle_url: Option<String>,
    url_base: String,
    configured_total: Option<u64>,
    client: Client,
    // HEAD 结果（包括探测失败的 None）缓存 10 分钟
    head_cache: TtlCache<Option<u64>>,
}

impl BundleProbe {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent("backtestd/0.1")
            .build()?;
        Ok(Self {
            bundle_path: cfg.bundle_path.clone(),
            status_file: cfg.bundle_status_file.clone(),
            bundle_url: cfg.bundle_url.clone(),
            url_base: cfg.bundle_url_base.clone(),
            configured_total: cfg.bundle_total_bytes,
            client,
            head_cache: TtlCache::new(TOTAL_BYTES_TTL),
        })
    }

    pub async fn status(&self) -> BundleStatus {
        let bundle_path = self.bundle_path.clone();
        let status_file = self.status_file.clone();
        // 目录遍历是阻塞 IO，放到阻塞线程池
        let local = tokio::task::spawn_blocking(move || scan_local(&bundle_path, &status_file))
            .await
            .unwrap_or_else(|e| {
                warn!("扫描 bundle 目录失败: {}", e);
                LocalScan::default()
            });
        let LocalScan {
            ready,
            status,
            message,
            status_payload,
            downloaded_bytes,
        } = local;

        let total_bytes = self.total_bytes(status_payload.as_ref()).await;
        let percent = match total_bytes {
            Some(total) if total > 0 && downloaded_bytes > 0 => {
                let pct = (downloaded_bytes as f64 / total as f64 * 100.0).min(100.0);
                Some((pct * 100.0).round() / 100.0)
            }
            _ => None,
        };

        BundleStatus {
            ready,
            status,
            message,
            progress: BundleProgress {
                downloaded_bytes,
                total_bytes,
                percent,
            },
        }
    }

    async fn total_bytes(&self, status_payload: Option<&Value>) -> Option<u64> {
        if let Some(n) = self.configured_total {
            return Some(n);
        }
        let from_file = status_payload
            .and_then(|p| p.get("total_bytes"))
            .and_then(|v| v.as_u64().or_else(|| v.as_str()?.trim().parse().ok()))
            .filter(|n| *n > 0);
        if from_file.is_some() {
            return from_file;
        }

        if let Some(cached) = self.head_cache.get() {
            return cached;
        }
        let mut total = None;
        for url in self.url_candidates(status_payload) {
            match self.client.head(&url).send().await {
                Ok(resp) => {
                    if let Some(len) = resp.content_length().filter(|n| *n > 0) {
                        debug!("bundle 大小 {} 字节: {}", len, url);
                        total = Some(len);
                        break;
                    }
                }
                Err(e) => debug!("HEAD {} 失败: {}", url, e),
            }
        }
        self.head_cache.set(total);
        total
    }

    /// 显式地址优先，其次状态文件里的 url，否则按月份回推最近 12 个包
    fn url_candidates(&self, status_payload: Option<&Value>) -> Vec<String> {
        if let Some(url) = &self.bundle_url {
            return vec![url.clone()];
        }
        if let Some(url) = status_payload
            .and_then(|p| p.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return vec![url.to_string()];
        }
        if self.url_base.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        let (mut year, mut month) = (now.year(), now.month());
        let mut out = Vec::with_capacity(12);
        for _ in 0..12 {
            out.push(format!("{}/rqbundle_{}{:02}.tar.bz2", self.url_base, year, month));
            if month == 1 {
                month = 12;
                year -= 1;
            } else {
                month -= 1;
            }
        }
        out
    }
}

/// 本地文件系统上能看到的部分
#[derive(Debug, Default)]
struct LocalScan {
    ready: bool,
    status: String,
    message: String,
    status_payload: Option<Value>,
    downloaded_bytes: u64,
}

fn scan_local(bundle_path: &Path, status_file: &Path) -> LocalScan {
    let ready = is_ready(bundle_path);
    let status_payload = read_status_file(status_file);
    let field = |key: &str| {
        status_payload
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    let (status, message, size_path) = if ready {
        ("ready".to_string(), "bundle ready".to_string(), bundle_path.to_path_buf())
    } else {
        let size_path = field("work_dir")
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .unwrap_or_else(|| bundle_path.to_path_buf());
        (
            field("status").unwrap_or_else(|| "downloading".to_string()),
            field("message").unwrap_or_else(|| "bundle downloading".to_string()),
            size_path,
        )
    };

    LocalScan {
        ready,
        status,
        message,
        downloaded_bytes: dir_size_bytes(&size_path),
        status_payload,
    }
}

fn is_ready(bundle_path: &Path) -> bool {
    REQUIRED_FILES.iter().all(|name| {
        std::fs::metadata(bundle_path.join(name))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    })
}

fn read_status_file(path: &Path) -> Option<Value> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice::<Value>(&raw) {
        Ok(v) if v.is_object() => Some(v),
        Ok(_) => None,
        Err(e) => {
            warn!("bundle 状态文件格式错误 {}: {}", path.display(), e);
            None
        }
    }
}

fn dir_size_bytes(path: &Path) -> u64 {
    let Ok(meta) = std::fs::metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.metadata() {
                Ok(m) if m.is_dir() => stack.push(entry.path()),
                Ok(m) => total += m.len(),
                Err(_) => {}
            }
        }
    }
    total
}
