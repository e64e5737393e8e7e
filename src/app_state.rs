use crate::backtest::model::JobStats;
use crate::backtest::BacktestService;
use crate::bundle::BundleProbe;
use crate::config::Config;
use crate::storage;
use crate::strategy::{CodeSource, FileCodeSource, PythonChecker, RenameGraph, StrategyService};
use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum AppEvent {
    Log(String),
    Message(String),
    Error(String),
    Json(Value),
    Stats(JobStats),
}

/// 进程内共享的服务实例
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backtest: BacktestService,
    pub strategies: StrategyService,
    pub bundle: Arc<BundleProbe>,
}

impl AppState {
    pub async fn init(
        config: Config,
        evt_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.base_dir)
            .await
            .with_context(|| format!("create {}", config.base_dir.display()))?;
        let db = storage::establish_connection(&config.database_url)
            .await
            .with_context(|| format!("connect {}", config.database_url))?;
        let db = Arc::new(db);
        let config = Arc::new(config);

        let graph = Arc::new(RenameGraph::new(db.clone()));
        let code_source: Arc<dyn CodeSource> =
            Arc::new(FileCodeSource::new(config.strategies_dir()));
        let backtest =
            BacktestService::new(db.clone(), config.clone(), graph.clone(), code_source.clone())
                .with_events(evt_tx);
        let strategies = StrategyService::new(graph, code_source, backtest.clone())
            .with_checker(Arc::new(PythonChecker::from_config(&config)));
        let bundle = Arc::new(BundleProbe::from_config(&config)?);

        Ok(Self {
            config,
            backtest,
            strategies,
            bundle,
        })
    }
}
