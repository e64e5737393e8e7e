use crate::app_state::AppEvent;
use crate::backtest::BacktestService;
use log::warn;
use tokio::sync::mpsc;

pub async fn refresh_stats(service: &BacktestService, tx: &mpsc::UnboundedSender<AppEvent>) {
    match service.stats().await {
        Ok(stats) => {
            let _ = tx.send(AppEvent::Stats(stats));
        }
        Err(e) => warn!("统计查询失败: {}", e),
    }
}
