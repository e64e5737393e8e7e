use crate::config::{split_command, Config};
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// 把 result.pkl 转成 JSON 文档。失败不重试。
#[async_trait]
pub trait ResultExtractor: Send + Sync {
    async fn extract(&self, artifact: &Path) -> anyhow::Result<Value>;
}

/// 调外部命令：`<command> <artifact>`，stdout 输出 JSON。超时后子进程被杀掉。
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(crate::config::DEFAULT_EXTRACT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut parts = split_command(&cfg.extractor_command);
        let extractor = if parts.is_empty() {
            Self::new("python3", vec!["-m".to_string(), "rq_extract".to_string()])
        } else {
            let program = parts.remove(0);
            Self::new(program, parts)
        };
        extractor.with_timeout(cfg.extract_timeout)
    }
}

#[async_trait]
impl ResultExtractor for CommandExtractor {
    async fn extract(&self, artifact: &Path) -> anyhow::Result<Value> {
        let run = Command::new(&self.program)
            .args(&self.args)
            .arg(artifact)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output.with_context(|| format!("spawn extractor {}", self.program))?,
            Err(_) => bail!("extractor timeout after {}s", self.timeout.as_secs()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "extractor exit code={:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("extractor output is not valid JSON")
    }
}
