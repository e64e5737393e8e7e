use backtestd::app_service::refresh_stats;
use backtestd::commands::{self, AppCommand};
use backtestd::config::Config;
use backtestd::{AppEvent, AppState};
use chrono::Local;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let log_dir = std::path::PathBuf::from("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(format!("app-{}.log", ts));
    let log_file = std::fs::File::create(&log_path)?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file))) // 日志只写文件，stdout 留给命令输出
        .filter_level(log::LevelFilter::Warn)
        .filter_module("backtestd", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();

    match dotenv::dotenv() {
        Ok(path) => info!("✓ 已加载 {}", path.display()),
        Err(_) => info!("⚠ 未找到 .env，使用系统环境变量"),
    }

    let config = Config::from_env();
    info!(
        "🚀 backtestd 启动: base_dir={}, timeout={}s, window={}s",
        config.base_dir.display(),
        config.timeout.as_secs(),
        config.idempotency_window.as_secs()
    );

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<AppCommand>();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();

    let state = AppState::init(config, evt_tx.clone()).await?;

    // 上次进程留下的 QUEUED/RUNNING 任务统一标记失败
    match state.backtest.recover().await {
        Ok(0) => {}
        Ok(n) => {
            let _ = evt_tx.send(AppEvent::Message(format!("已将 {} 个中断任务标记为 FAILED", n)));
        }
        Err(e) => warn!("恢复任务失败: {}", e),
    }

    // 事件输出
    let printer = tokio::spawn(async move {
        while let Some(evt) = evt_rx.recv().await {
            match evt {
                AppEvent::Log(line) | AppEvent::Message(line) => println!("{}", line),
                AppEvent::Error(line) => eprintln!("✗ {}", line),
                AppEvent::Json(value) => match serde_json::to_string_pretty(&value) {
                    Ok(text) => println!("{}", text),
                    Err(_) => println!("{}", value),
                },
                AppEvent::Stats(stats) => println!(
                    "任务统计: 总数 {} | 排队 {} | 运行 {} | 完成 {} | 失败 {} | 取消 {}",
                    stats.total,
                    stats.queued,
                    stats.running,
                    stats.finished,
                    stats.failed,
                    stats.cancelled
                ),
            }
        }
    });

    // 单后台任务处理命令 (Actor)
    let actor_state = state.clone();
    let actor_tx = evt_tx.clone();
    let actor = tokio::spawn(async move {
        refresh_stats(&actor_state.backtest, &actor_tx).await;
        while let Some(cmd) = cmd_rx.recv().await {
            if !commands::dispatch(cmd, &actor_state, &actor_tx).await {
                break;
            }
        }
    });

    let _ = evt_tx.send(AppEvent::Message(commands::app_command::HELP_TEXT.to_string()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match line.parse::<AppCommand>() {
            Ok(cmd) => cmd,
            Err(never) => match never {},
        };
        let quit = cmd == AppCommand::Quit;
        if cmd_tx.send(cmd).is_err() || quit {
            break;
        }
    }
    drop(cmd_tx);
    let _ = actor.await;

    info!("backtestd 退出");
    drop(state);
    drop(evt_tx);
    // 仍在运行的任务持有事件发送端，这里只等待已排队的输出
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), printer).await;
    Ok(())
}
