use crate::backtest::files::{CONFIG_FILE, LOG_FILE, STRATEGY_FILE};
use crate::config::{split_command, Config};
use anyhow::Context;
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// 进程退出；被信号终止时没有退出码
    Exited(Option<i32>),
    TimedOut,
}

/// 在任务目录里运行回测引擎
#[async_trait]
pub trait BacktestLauncher: Send + Sync {
    /// 超时后进程已被杀掉；`cancel` 被通知时尽力终止进程并等待其退出
    async fn launch(
        &self,
        job_dir: &Path,
        timeout: Duration,
        cancel: Arc<Notify>,
    ) -> anyhow::Result<ProcessExit>;
}

pub struct RqalphaLauncher {
    program: String,
    args: Vec<String>,
}

impl RqalphaLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let (program, args) = resolve_command(&cfg.rqalpha_command);
        info!("回测引擎命令: {} {}", program, args.join(" "));
        Self::new(program, args)
    }

    pub fn command_line(&self) -> Vec<String> {
        let mut out = vec![self.program.clone()];
        out.extend(self.args.iter().cloned());
        out.extend(
            ["run", "-f", STRATEGY_FILE, "--config", CONFIG_FILE]
                .iter()
                .map(|s| s.to_string()),
        );
        out
    }
}

/// 配置的命令优先，其次 PATH 上的 rqalpha，最后 `python3 -m rqalpha`
pub fn resolve_command(configured: &str) -> (String, Vec<String>) {
    let mut parts = split_command(configured);
    if !parts.is_empty() {
        let program = parts.remove(0);
        return (program, parts);
    }
    if let Some(path) = find_on_path("rqalpha") {
        return (path.display().to_string(), Vec::new());
    }
    (
        "python3".to_string(),
        vec!["-m".to_string(), "rqalpha".to_string()],
    )
}

fn find_on_path(bin: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(bin))
        .find(|p| p.is_file())
}

#[async_trait]
impl BacktestLauncher for RqalphaLauncher {
    async fn launch(
        &self,
        job_dir: &Path,
        timeout: Duration,
        cancel: Arc<Notify>,
    ) -> anyhow::Result<ProcessExit> {
        let log_path = job_dir.join(LOG_FILE);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open {}", log_path.display()))?;
        let log_err = log.try_clone()?;

        let cmd = self.command_line();
        let mut child = Command::new(&cmd[0])
            .args(&cmd[1..])
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", cmd[0]))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.context("wait for engine process")?;
                Ok(ProcessExit::Exited(status.code()))
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("回测进程超时 ({}s)，终止: {}", timeout.as_secs(), job_dir.display());
                if let Err(e) = child.kill().await {
                    warn!("终止超时进程失败: {}", e);
                }
                Ok(ProcessExit::TimedOut)
            }
            _ = cancel.notified() => {
                info!("收到取消请求，终止回测进程: {}", job_dir.display());
                if let Err(e) = child.start_kill() {
                    warn!("终止进程失败: {}", e);
                }
                let status = child.wait().await.context("wait for cancelled process")?;
                Ok(ProcessExit::Exited(status.code()))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> RqalphaLauncher {
        RqalphaLauncher::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn configured_command_is_split_and_extended() {
        let (program, args) = resolve_command("custom-rqalpha --foo");
        let launcher = RqalphaLauncher::new(program, args);
        assert_eq!(
            launcher.command_line(),
            vec![
                "custom-rqalpha",
                "--foo",
                "run",
                "-f",
                "strategy.py",
                "--config",
                "config.yml"
            ]
        );
    }

    #[tokio::test]
    async fn exit_code_and_output_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let exit = shell("echo hello; echo oops >&2; exit 3")
            .launch(dir.path(), Duration::from_secs(10), Arc::new(Notify::new()))
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Exited(Some(3)));
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert!(log.contains("hello") && log.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let exit = shell("sleep 30")
            .launch(dir.path(), Duration::from_millis(200), Arc::new(Notify::new()))
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_terminates_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = Arc::new(Notify::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.notify_one();
        });
        let started = Instant::now();
        let exit = shell("sleep 30")
            .launch(dir.path(), Duration::from_secs(60), cancel)
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Exited(None));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
