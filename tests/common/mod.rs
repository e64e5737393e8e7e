#![allow(dead_code)]

use async_trait::async_trait;
use backtestd::backtest::model::{RunRequest, StatusRecord};
use backtestd::backtest::{BacktestLauncher, BacktestService, JobStatus, ProcessExit, ResultExtractor};
use backtestd::config::Config;
use backtestd::storage::establish_connection;
use sea_orm::DatabaseConnection;
use backtestd::strategy::compile::RawDiagnostic;
use backtestd::strategy::{
    CheckOutput, CodeSource, FileCodeSource, RenameGraph, StrategyChecker, StrategyService,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const DEMO_CODE: &str = "def init(context):\n    pass\n";

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// 写出 result.pkl 后正常退出
    Succeed,
    Exit(i32),
    Killed,
    /// 退出码 0 但没有产物
    NoResult,
    TimedOut,
    /// 阻塞到收到取消信号
    WaitForCancel,
}

pub struct FakeLauncher {
    pub behavior: Behavior,
    pub calls: AtomicUsize,
    /// 设置后，launch 先等这个信号再继续
    pub gate: Option<Arc<Notify>>,
}

impl FakeLauncher {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(behavior: Behavior, gate: Arc<Notify>) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BacktestLauncher for FakeLauncher {
    async fn launch(
        &self,
        job_dir: &Path,
        _timeout: Duration,
        cancel: Arc<Notify>,
    ) -> anyhow::Result<ProcessExit> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        tokio::fs::write(job_dir.join("run.log"), b"engine started\nengine done\n").await?;
        Ok(match self.behavior {
            Behavior::Succeed => {
                tokio::fs::write(job_dir.join("result.pkl"), b"pickle").await?;
                ProcessExit::Exited(Some(0))
            }
            Behavior::Exit(code) => ProcessExit::Exited(Some(code)),
            Behavior::Killed => ProcessExit::Exited(None),
            Behavior::NoResult => ProcessExit::Exited(Some(0)),
            Behavior::TimedOut => ProcessExit::TimedOut,
            Behavior::WaitForCancel => {
                cancel.notified().await;
                ProcessExit::Exited(None)
            }
        })
    }
}

pub struct FakeExtractor {
    pub payload: Option<Value>,
    pub calls: AtomicUsize,
    /// 返回前先睡这么久
    pub delay: Option<Duration>,
}

impl FakeExtractor {
    pub fn ok() -> Self {
        Self {
            payload: Some(sample_result()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            payload: None,
            ..Self::ok()
        }
    }

    pub fn hanging() -> Self {
        Self {
            delay: Some(Duration::from_secs(30)),
            ..Self::ok()
        }
    }
}

#[async_trait]
impl ResultExtractor for FakeExtractor {
    async fn extract(&self, artifact: &Path) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(artifact.exists(), "artifact missing");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.payload {
            Some(v) => Ok(v.clone()),
            None => anyhow::bail!("unpickling failed"),
        }
    }
}

/// 按源码内容给出结果：含 `def (` 视为语法错误，含 `import missing_pkg` 视为缺依赖
#[derive(Default)]
pub struct FakeChecker {
    pub seen: Mutex<Vec<String>>,
}

impl FakeChecker {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StrategyChecker for FakeChecker {
    async fn check(&self, code: &str) -> anyhow::Result<CheckOutput> {
        self.seen.lock().unwrap().push(code.to_string());
        let diag = |line: i64, column: i64, message: &str| RawDiagnostic {
            line: Some(line),
            column: Some(column),
            level: None,
            message: Some(message.to_string()),
        };
        if code.contains("def (") {
            return Ok(CheckOutput {
                ok: false,
                stderr: "SyntaxError: invalid syntax".into(),
                diagnostics: vec![diag(2, 5, "invalid syntax")],
                ..Default::default()
            });
        }
        if code.contains("import missing_pkg") {
            return Ok(CheckOutput {
                ok: false,
                stdout: "syntax check passed".into(),
                diagnostics: vec![
                    diag(3, 1, "module 'zzz' is not installed"),
                    diag(1, 1, "module 'missing_pkg' is not installed"),
                ],
                ..Default::default()
            });
        }
        Ok(CheckOutput {
            ok: true,
            stdout: "syntax check passed\ndependency check passed".into(),
            ..Default::default()
        })
    }
}

pub fn sample_result() -> Value {
    json!({
        "summary": { "total_returns": 0.12, "max_drawdown": -0.05 },
        "equity": {
            "dates": ["2024-01-02", "2024-01-03"],
            "nav": [1.0, 1.01],
            "returns": [0.0, 0.01],
        },
        "benchmark_portfolio": { "unit_net_value": [1.0, 1.005] },
        "trades": [
            { "order_book_id": "000001.XSHE", "side": "BUY" },
            { "order_book_id": "000002.XSHE", "side": "SELL" },
            { "order_book_id": "000001.XSHE", "side": "SELL" },
        ],
    })
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub db: Arc<DatabaseConnection>,
    pub graph: Arc<RenameGraph>,
    pub code: Arc<dyn CodeSource>,
    pub launcher: Arc<FakeLauncher>,
    pub extractor: Arc<FakeExtractor>,
    pub checker: Arc<FakeChecker>,
    pub service: BacktestService,
    pub strategies: StrategyService,
}

pub async fn harness(launcher: FakeLauncher) -> Harness {
    harness_with(launcher, FakeExtractor::ok(), |_| {}).await
}

pub async fn harness_with(
    launcher: FakeLauncher,
    extractor: FakeExtractor,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_base_dir(dir.path());
    config.bundle_path = dir.path().join("bundle");
    tweak(&mut config);
    let config = Arc::new(config);

    let db = Arc::new(establish_connection(&config.database_url).await.unwrap());
    let graph = Arc::new(RenameGraph::new(db.clone()));
    let code: Arc<dyn CodeSource> = Arc::new(FileCodeSource::new(config.strategies_dir()));
    let launcher = Arc::new(launcher);
    let extractor = Arc::new(extractor);
    let service = BacktestService::new(db.clone(), config.clone(), graph.clone(), code.clone())
        .with_launcher(launcher.clone())
        .with_extractor(extractor.clone());
    let checker = Arc::new(FakeChecker::default());
    let strategies = StrategyService::new(graph.clone(), code.clone(), service.clone())
        .with_checker(checker.clone());

    Harness {
        dir,
        config,
        db,
        graph,
        code,
        launcher,
        extractor,
        checker,
        service,
        strategies,
    }
}

impl Harness {
    pub async fn save(&self, strategy_id: &str) {
        self.code.save(strategy_id, DEMO_CODE).await.unwrap();
    }

    /// 轮询直到任务进入终态
    pub async fn wait_terminal(&self, job_id: &str) -> StatusRecord {
        for _ in 0..500 {
            let record = self.service.job_status(job_id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }

    pub async fn wait_status(&self, job_id: &str, status: JobStatus) {
        for _ in 0..500 {
            if self.service.job_status(job_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status}");
    }
}

pub fn request(strategy_id: &str) -> RunRequest {
    RunRequest {
        strategy_id: Some(strategy_id.to_string()),
        start_date: Some("2024-01-01".to_string()),
        end_date: Some("2024-03-31".to_string()),
        ..Default::default()
    }
}
