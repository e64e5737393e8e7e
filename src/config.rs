use log::warn;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_IDEMPOTENCY_WINDOW_SECS: u64 = 30;
pub const DEFAULT_KEEP_DAYS: i64 = 30;
pub const DEFAULT_EXTRACT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CANCELLED_EXIT_CODE: i32 = 130;
pub const DEFAULT_BUNDLE_URL_BASE: &str = "http://bundle.assets.ricequant.com/bundles_v4";

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub database_url: String,
    pub timeout: Duration,
    pub idempotency_window: Duration,
    pub keep_days: i64,
    pub allowed_frequencies: BTreeSet<String>,
    /// 回测引擎命令，空白分隔；为空时自动探测
    pub rqalpha_command: String,
    pub bundle_path: PathBuf,
    pub bundle_status_file: PathBuf,
    pub bundle_url: Option<String>,
    /// 按月拼接 bundle 下载地址的前缀；为空时不做 HEAD 探测
    pub bundle_url_base: String,
    pub bundle_total_bytes: Option<u64>,
    pub cancelled_exit_code: i32,
    pub extractor_command: String,
    pub extract_timeout: Duration,
    /// 编译检查用的 Python 解释器命令
    pub compile_command: String,
    pub compile_timeout: Duration,
}

impl Config {
    /// 读取进程环境变量；`.env` 由 main 预先加载
    pub fn from_env() -> Self {
        let base_dir = std::env::var("BACKTEST_BASE_DIR")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/backtest"));

        let mut cfg = Self::for_base_dir(&base_dir);

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                cfg.database_url = url.trim().to_string();
            }
        }
        cfg.timeout = Duration::from_secs(
            env_u64("BACKTEST_TIMEOUT", DEFAULT_TIMEOUT_SECS).max(1),
        );
        cfg.idempotency_window = Duration::from_secs(env_u64(
            "BACKTEST_IDEMPOTENCY_WINDOW_SECONDS",
            DEFAULT_IDEMPOTENCY_WINDOW_SECS,
        ));
        cfg.keep_days = env_u64("BACKTEST_KEEP_DAYS", DEFAULT_KEEP_DAYS as u64) as i64;
        if let Ok(raw) = std::env::var("BACKTEST_ALLOWED_FREQUENCIES") {
            let parsed = parse_frequencies(&raw);
            if !parsed.is_empty() {
                cfg.allowed_frequencies = parsed;
            }
        }
        cfg.rqalpha_command = std::env::var("RQALPHA_COMMAND")
            .unwrap_or_default()
            .trim()
            .to_string();
        if let Ok(p) = std::env::var("RQALPHA_BUNDLE_PATH") {
            if !p.trim().is_empty() {
                cfg.bundle_path = PathBuf::from(p.trim());
            }
        }
        if let Ok(p) = std::env::var("RQALPHA_BUNDLE_STATUS_FILE") {
            if !p.trim().is_empty() {
                cfg.bundle_status_file = PathBuf::from(p.trim());
            }
        }
        cfg.bundle_url = std::env::var("RQALPHA_BUNDLE_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Ok(base) = std::env::var("RQALPHA_BUNDLE_URL_BASE") {
            cfg.bundle_url_base = base.trim().trim_end_matches('/').to_string();
        }
        cfg.bundle_total_bytes = Some(env_u64("RQALPHA_BUNDLE_TOTAL_BYTES", 0)).filter(|n| *n > 0);
        cfg.cancelled_exit_code = std::env::var("RQALPHA_CANCELLED_EXIT_CODE")
            .ok()
            .and_then(|s| match s.trim().parse::<i32>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("RQALPHA_CANCELLED_EXIT_CODE={} 不是整数，使用默认值", s);
                    None
                }
            })
            .unwrap_or(DEFAULT_CANCELLED_EXIT_CODE);
        if let Ok(cmd) = std::env::var("RESULT_EXTRACTOR_COMMAND") {
            if !cmd.trim().is_empty() {
                cfg.extractor_command = cmd.trim().to_string();
            }
        }
        cfg.extract_timeout = Duration::from_secs(
            env_u64("BACKTEST_EXTRACT_TIMEOUT", DEFAULT_EXTRACT_TIMEOUT_SECS).max(1),
        );
        if let Ok(cmd) = std::env::var("BACKTEST_COMPILE_PYTHON") {
            if !cmd.trim().is_empty() {
                cfg.compile_command = cmd.trim().to_string();
            }
        }
        cfg.compile_timeout = Duration::from_secs(
            env_u64("BACKTEST_COMPILE_TIMEOUT", DEFAULT_COMPILE_TIMEOUT_SECS).max(1),
        );
        cfg
    }

    /// 以 `base_dir` 为根的默认配置，`from_env` 和测试都从这里开始
    pub fn for_base_dir(base_dir: &Path) -> Self {
        let db_path = base_dir.join("backtest_meta.sqlite3");
        Self {
            base_dir: base_dir.to_path_buf(),
            database_url: format!("sqlite://{}?mode=rwc", db_path.display()),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            idempotency_window: Duration::from_secs(DEFAULT_IDEMPOTENCY_WINDOW_SECS),
            keep_days: DEFAULT_KEEP_DAYS,
            allowed_frequencies: BTreeSet::from(["1d".to_string()]),
            rqalpha_command: String::new(),
            bundle_path: PathBuf::from("/data/rqalpha/bundle"),
            bundle_status_file: PathBuf::from("/data/rqalpha/bundle_status.json"),
            bundle_url: None,
            bundle_url_base: DEFAULT_BUNDLE_URL_BASE.to_string(),
            bundle_total_bytes: None,
            cancelled_exit_code: DEFAULT_CANCELLED_EXIT_CODE,
            extractor_command: "python3 -m rq_extract".to_string(),
            extract_timeout: Duration::from_secs(DEFAULT_EXTRACT_TIMEOUT_SECS),
            compile_command: "python3".to_string(),
            compile_timeout: Duration::from_secs(DEFAULT_COMPILE_TIMEOUT_SECS),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    pub fn strategies_dir(&self) -> PathBuf {
        self.base_dir.join("strategies")
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                warn!("{}={} 不是非负整数，使用默认值 {}", key, raw, default);
                default
            }
        },
        _ => default,
    }
}

fn parse_frequencies(raw: &str) -> BTreeSet<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

/// 按空白切分命令行，不支持引号
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}
