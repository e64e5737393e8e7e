pub mod app_command;

pub use app_command::AppCommand;

use crate::app_service::refresh_stats;
use crate::app_state::{AppEvent, AppState};
use crate::backtest::RunRequest;
use crate::error::ServiceError;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<AppEvent>, value: &T) {
    match serde_json::to_value(value) {
        Ok(v) => {
            let _ = tx.send(AppEvent::Json(v));
        }
        Err(e) => {
            let _ = tx.send(AppEvent::Error(format!("序列化失败: {}", e)));
        }
    }
}

/// 错误转成给用户看的一行文字，冲突和未就绪附带结构化信息
fn send_error(tx: &mpsc::UnboundedSender<AppEvent>, err: ServiceError) {
    let line = match &err {
        ServiceError::Conflict(conflict) => {
            let detail = serde_json::to_string(conflict).unwrap_or_default();
            format!("{}: {} {}", err.code(), err, detail)
        }
        ServiceError::ResultNotReady { status, detail } => format!(
            "{}: {} (status={}, detail={})",
            err.code(),
            err,
            status,
            detail.as_deref().unwrap_or("-")
        ),
        _ => format!("{}: {}", err.code(), err),
    };
    let _ = tx.send(AppEvent::Error(line));
}

/// 执行一条命令；返回 false 表示退出
pub async fn dispatch(
    cmd: AppCommand,
    state: &AppState,
    tx: &mpsc::UnboundedSender<AppEvent>,
) -> bool {
    match cmd {
        AppCommand::Run {
            strategy_id,
            start_date,
            end_date,
            cash,
            benchmark,
            frequency,
        } => {
            let req = RunRequest {
                strategy_id: Some(strategy_id),
                start_date: Some(start_date),
                end_date: Some(end_date),
                cash,
                benchmark,
                frequency,
            };
            match state.backtest.submit(&req).await {
                Ok(out) if out.reused => {
                    let _ = tx.send(AppEvent::Message(format!(
                        "相同任务仍在幂等窗口内，复用 [{}]",
                        out.job_id
                    )));
                    send_json(tx, &out);
                }
                Ok(out) => send_json(tx, &out),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Cancel { job_id } => match state.backtest.cancel(&job_id).await {
            Ok(status) => send_json(tx, &json!({ "job_id": job_id, "status": status })),
            Err(e) => send_error(tx, e),
        },
        AppCommand::Status { job_id } => match state.backtest.job_status(&job_id).await {
            Ok(status) => send_json(
                tx,
                &json!({
                    "job_id": job_id,
                    "status": status.status,
                    "updated_at": status.updated_at,
                    "error": status.error,
                }),
            ),
            Err(e) => send_error(tx, e),
        },
        AppCommand::Result { job_id, page } => {
            match state.backtest.job_result(&job_id, page).await {
                Ok(doc) => send_json(tx, &doc),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Log { job_id, window } => match state.backtest.job_log(&job_id, window).await {
            Ok(slice) => send_json(tx, &slice),
            Err(e) => send_error(tx, e),
        },
        AppCommand::Jobs {
            strategy_id,
            limit,
            offset,
            status,
        } => match state
            .backtest
            .list_jobs_for_strategy(&strategy_id, limit, offset, status.as_deref())
            .await
        {
            Ok(page) => send_json(tx, &page),
            Err(e) => send_error(tx, e),
        },
        AppCommand::DeleteJob { job_id } => match state.backtest.delete_job(&job_id).await {
            Ok(()) => send_json(tx, &json!({ "job_id": job_id, "deleted": true })),
            Err(e) => send_error(tx, e),
        },
        AppCommand::Save { strategy_id, file } => match tokio::fs::read_to_string(&file).await {
            Ok(code) => match state.strategies.save_strategy(&strategy_id, &code).await {
                Ok(meta) => send_json(tx, &meta),
                Err(e) => send_error(tx, e),
            },
            Err(e) => {
                let _ = tx.send(AppEvent::Error(format!("读取文件失败 {}: {}", file, e)));
            }
        },
        AppCommand::Show { strategy_id } => {
            match state.strategies.load_strategy_detail(&strategy_id).await {
                Ok(detail) => send_json(tx, &detail),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Strategies { limit, offset, q } => {
            match state
                .strategies
                .list_strategies(q.as_deref(), limit, offset)
                .await
            {
                Ok(page) => send_json(tx, &page),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Compile { strategy_id, file } => {
            let code = match &file {
                Some(path) => match tokio::fs::read_to_string(path).await {
                    Ok(code) => Some(code),
                    Err(e) => {
                        let _ = tx.send(AppEvent::Error(format!("读取文件失败 {}: {}", path, e)));
                        return true;
                    }
                },
                None => None,
            };
            match state
                .strategies
                .compile_strategy(&strategy_id, code.as_deref())
                .await
            {
                Ok(report) => send_json(tx, &report),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Rename {
            from_id,
            to_id,
            code_file,
        } => {
            let code = match &code_file {
                Some(path) => match tokio::fs::read_to_string(path).await {
                    Ok(code) => Some(code),
                    Err(e) => {
                        let _ = tx.send(AppEvent::Error(format!("读取文件失败 {}: {}", path, e)));
                        return true;
                    }
                },
                None => None,
            };
            match state
                .strategies
                .rename_strategy(&from_id, &to_id, code.as_deref(), None)
                .await
            {
                Ok(out) => send_json(tx, &out),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Map { from_id, to_id } => {
            match state.strategies.upsert_mapping(&from_id, &to_id, None).await {
                Ok(out) => send_json(tx, &json!({ "map": out.map, "warning": out.warning })),
                Err(e) => send_error(tx, e),
            }
        }
        AppCommand::Renames => match state.strategies.rename_map().await {
            Ok(map) => send_json(tx, &json!({ "map": map })),
            Err(e) => send_error(tx, e),
        },
        AppCommand::DeleteStrategy {
            strategy_id,
            cascade,
        } => match state.strategies.delete_strategy(&strategy_id, cascade).await {
            Ok(out) => send_json(tx, &out),
            Err(e) => send_error(tx, e),
        },
        AppCommand::Stats => refresh_stats(&state.backtest, tx).await,
        AppCommand::Bundle => {
            let status = state.bundle.status().await;
            send_json(tx, &status);
        }
        AppCommand::Help => {
            let _ = tx.send(AppEvent::Message(app_command::HELP_TEXT.to_string()));
        }
        AppCommand::Quit => return false,
        AppCommand::Unknown(msg) => {
            if !msg.is_empty() {
                let _ = tx.send(AppEvent::Error(msg));
            }
        }
    }
    true
}
