mod common;

use backtestd::backtest::model::{
    LogWindow, ERR_EXIT_NONZERO, ERR_INTERNAL, ERR_JOB_CANCELLED, ERR_RESULT_MISSING, ERR_TIMEOUT,
};
use backtestd::backtest::{files, JobStatus};
use backtestd::error::ServiceError;
use backtestd::storage::entity::{job_index, run_fingerprint, JobIndex, RunFingerprint};
use backtestd::storage::repository::JobIndexRepository;
use common::{harness, harness_with, request, Behavior, FakeExtractor, FakeLauncher};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn finished_job_exposes_result_and_log() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    assert!(!out.reused);
    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Finished);
    assert!(record.error.is_none());

    let doc = h.service.job_result(&out.job_id, None).await.unwrap();
    assert_eq!(doc.trades_total, 3);
    assert_eq!(doc.trades.len(), 3);
    assert_eq!(doc.equity.nav.len(), 2);
    assert_eq!(doc.equity.benchmark_nav.len(), 2, "benchmark falls back to benchmark_portfolio");
    assert_eq!(doc.trade_columns, vec!["order_book_id", "side"]);

    let page = h.service.job_result(&out.job_id, Some((2, 2))).await.unwrap();
    assert_eq!(page.trades.len(), 1);
    assert_eq!(page.trades_total, 3);
    assert_eq!(page.page, Some(2));

    let err = h.service.job_result(&out.job_id, Some((0, 2))).await.unwrap_err();
    assert_eq!(err.to_string(), "page must be >= 1");

    let full = h.service.job_log(&out.job_id, LogWindow::Full).await.unwrap();
    assert!(full.content.contains("engine started"));
    assert_eq!(full.next_offset, full.size);

    let tail = h.service.job_log(&out.job_id, LogWindow::Tail(5)).await.unwrap();
    assert_eq!(tail.content, "done\n");
    assert_eq!(tail.offset, full.size - 5);

    let err = h.service.job_log(&out.job_id, LogWindow::Tail(0)).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));

    let dir = h.config.runs_dir();
    let job_dir = std::fs::read_dir(&dir)
        .unwrap()
        .flatten()
        .map(|d| d.path().join(&out.job_id))
        .find(|p| p.exists())
        .unwrap();
    for name in ["strategy.py", "config.yml", "status.json", "meta.json", "extracted.json"] {
        assert!(job_dir.join(name).exists(), "{name} missing");
    }
    let yaml = std::fs::read_to_string(job_dir.join("config.yml")).unwrap();
    assert!(yaml.contains("result.pkl"));
    assert!(yaml.contains("2024-01-01"));
    assert!(yaml.contains("sys_analyser"));
}

#[tokio::test]
async fn duplicate_submit_inside_window_reuses_job() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let first = h.service.submit(&request("demo")).await.unwrap();
    h.wait_terminal(&first.job_id).await;
    let second = h.service.submit(&request("demo")).await.unwrap();
    assert_eq!(second.job_id, first.job_id);
    assert!(second.reused);
    assert_eq!(h.launcher.calls(), 1);

    // 参数不同则是新任务
    let mut other = request("demo");
    other.cash = Some(50_000.0);
    let third = h.service.submit(&other).await.unwrap();
    assert_ne!(third.job_id, first.job_id);
    h.wait_terminal(&third.job_id).await;
    assert_eq!(h.launcher.calls(), 2);
}

#[tokio::test]
async fn concurrent_duplicates_create_one_job() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let req = request("demo");
    let (a, b, c) = tokio::join!(
        h.service.submit(&req),
        h.service.submit(&req),
        h.service.submit(&req)
    );
    let ids = [a.unwrap().job_id, b.unwrap().job_id, c.unwrap().job_id];
    assert!(ids.iter().all(|id| *id == ids[0]));
    h.wait_terminal(&ids[0]).await;
    assert_eq!(h.launcher.calls(), 1);
}

#[tokio::test]
async fn zero_window_disables_reuse() {
    let h = harness_with(FakeLauncher::new(Behavior::Succeed), FakeExtractor::ok(), |cfg| {
        cfg.idempotency_window = std::time::Duration::ZERO;
    })
    .await;
    h.save("demo").await;

    let a = h.service.submit(&request("demo")).await.unwrap();
    let b = h.service.submit(&request("demo")).await.unwrap();
    assert_ne!(a.job_id, b.job_id);
    h.wait_terminal(&a.job_id).await;
    h.wait_terminal(&b.job_id).await;
}

#[tokio::test]
async fn submit_rejects_bad_input() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let mut req = request("demo");
    req.end_date = Some("2023-12-31".into());
    let err = h.service.submit(&req).await.unwrap_err();
    assert_eq!(err.to_string(), "end_date must be >= start_date");

    let mut req = request("demo");
    req.frequency = Some("1m".into());
    let err = h.service.submit(&req).await.unwrap_err();
    assert!(err.to_string().starts_with("frequency must be one of"));

    let err = h.service.submit(&request("missing")).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert_eq!(h.launcher.calls(), 0);
}

#[tokio::test]
async fn cancel_running_job() {
    let h = harness(FakeLauncher::new(Behavior::WaitForCancel)).await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    h.wait_status(&out.job_id, JobStatus::Running).await;

    let now = h.service.cancel(&out.job_id).await.unwrap();
    assert!(matches!(now.status, JobStatus::Running | JobStatus::Cancelled));

    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.error.unwrap().code, ERR_JOB_CANCELLED);
    // 标记在终态写完之后才清除
    for _ in 0..100 {
        if !h.service.cancels().is_requested(&out.job_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.service.cancels().is_requested(&out.job_id));

    // 终态任务再次取消只返回当前状态
    let again = h.service.cancel(&out.job_id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
    assert!(!h.service.cancels().is_requested(&out.job_id));
}

#[tokio::test]
async fn cancel_before_start_never_launches() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    // 单线程运行时：submit 返回时任务还没被调度
    let out = h.service.submit(&request("demo")).await.unwrap();
    h.service.cancels().request_cancel(&out.job_id);

    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.error.unwrap().code, ERR_JOB_CANCELLED);
    assert_eq!(h.launcher.calls(), 0);
    assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    let row = JobIndexRepository::find(h.db.as_ref(), &out.job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!std::path::Path::new(&row.job_dir).join(files::LOG_FILE).exists());
}

#[tokio::test]
async fn cancel_during_launch_wins_over_success() {
    let gate = Arc::new(Notify::new());
    let h = harness(FakeLauncher::gated(Behavior::Succeed, gate.clone())).await;
    h.save("demo").await;

    // 引擎在取消之后才正常退出，结果不再提取
    let out = h.service.submit(&request("demo")).await.unwrap();
    h.wait_status(&out.job_id, JobStatus::Running).await;
    h.service.cancel(&out.job_id).await.unwrap();
    gate.notify_one();

    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelled_exit_code_maps_to_cancelled() {
    let h = harness(FakeLauncher::new(Behavior::Exit(130))).await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.error.unwrap().code, ERR_JOB_CANCELLED);
}

#[tokio::test]
async fn engine_failures_are_classified() {
    let cases = [
        (Behavior::Exit(2), ERR_EXIT_NONZERO, "rqalpha exit code=2; see run.log"),
        (Behavior::Killed, ERR_EXIT_NONZERO, "rqalpha exit code=none; see run.log"),
        (Behavior::TimedOut, ERR_TIMEOUT, "rqalpha timeout after 900s; see run.log"),
        (
            Behavior::NoResult,
            ERR_RESULT_MISSING,
            "result.pkl not found; check sys_analyser.output_file",
        ),
    ];
    for (behavior, code, message) in cases {
        let h = harness(FakeLauncher::new(behavior)).await;
        h.save("demo").await;
        let out = h.service.submit(&request("demo")).await.unwrap();
        let record = h.wait_terminal(&out.job_id).await;
        assert_eq!(record.status, JobStatus::Failed, "{behavior:?}");
        let err = record.error.unwrap();
        assert_eq!(err.code, code);
        assert_eq!(err.message, message);

        match h.service.job_result(&out.job_id, None).await.unwrap_err() {
            ServiceError::ResultNotReady { status, detail } => {
                assert_eq!(status, "FAILED");
                assert_eq!(detail.as_deref(), Some(message));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn extractor_failure_is_internal_error() {
    let h = harness_with(
        FakeLauncher::new(Behavior::Succeed),
        FakeExtractor::failing(),
        |_| {},
    )
    .await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.unwrap().code, ERR_INTERNAL);
}

#[tokio::test]
async fn hanging_extractor_times_out_as_internal_error() {
    let h = harness_with(
        FakeLauncher::new(Behavior::Succeed),
        FakeExtractor::hanging(),
        |cfg| cfg.extract_timeout = Duration::from_millis(200),
    )
    .await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    let record = h.wait_terminal(&out.job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.code, ERR_INTERNAL);
    assert!(error.message.contains("timeout"), "{}", error.message);
}

#[tokio::test]
async fn result_of_running_job_is_not_ready() {
    let h = harness(FakeLauncher::new(Behavior::WaitForCancel)).await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    h.wait_status(&out.job_id, JobStatus::Running).await;
    match h.service.job_result(&out.job_id, None).await.unwrap_err() {
        ServiceError::ResultNotReady { status, detail } => {
            assert_eq!(status, "RUNNING");
            assert!(detail.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
    h.service.cancel(&out.job_id).await.unwrap();
    h.wait_terminal(&out.job_id).await;
}

#[tokio::test]
async fn unknown_and_unsafe_job_ids_are_not_found() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    for id in ["20240101_000000_deadbeef", "../etc", ""] {
        let err = h.service.job_status(id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)), "{id}");
        let err = h.service.cancel(id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)), "{id}");
    }
}

#[tokio::test]
async fn delete_job_removes_everything_once() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    h.wait_terminal(&out.job_id).await;

    h.service.delete_job(&out.job_id).await.unwrap();
    let err = h.service.delete_job(&out.job_id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    let err = h.service.job_status(&out.job_id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    // 指纹随任务删除，同样的请求会新建任务
    let again = h.service.submit(&request("demo")).await.unwrap();
    assert_ne!(again.job_id, out.job_id);
    assert!(!again.reused);
    h.wait_terminal(&again.job_id).await;
}

#[tokio::test]
async fn list_jobs_follows_renames_and_filters() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let first = h.service.submit(&request("demo")).await.unwrap();
    h.wait_terminal(&first.job_id).await;

    h.strategies
        .rename_strategy("demo", "alpha", None, None)
        .await
        .unwrap();
    let mut req = request("alpha");
    req.end_date = Some("2024-06-30".into());
    let second = h.service.submit(&req).await.unwrap();
    h.wait_terminal(&second.job_id).await;

    let page = h
        .service
        .list_jobs_for_strategy("demo", 50, 0, None)
        .await
        .unwrap();
    assert_eq!(page.strategy_id, "alpha");
    assert_eq!(page.total, 2);
    assert_eq!(page.jobs[0].job_id, second.job_id, "newest first");

    let page = h
        .service
        .list_jobs_for_strategy("alpha", 1, 1, Some("finished"))
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.jobs[0].job_id, first.job_id);

    let page = h
        .service
        .list_jobs_for_strategy("alpha", 10, 0, Some("FAILED"))
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let err = h
        .service
        .list_jobs_for_strategy("alpha", 10, 0, Some("bogus"))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("status must be one of"));
    let err = h
        .service
        .list_jobs_for_strategy("alpha", 0, 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "limit must be >= 1");
    let err = h
        .service
        .list_jobs_for_strategy("alpha", 1001, 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "limit must be <= 1000");
}

#[tokio::test]
async fn index_rows_without_strategy_fall_back_to_meta() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;
    h.save("other").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    h.wait_terminal(&out.job_id).await;
    JobIndex::update_many()
        .col_expr(job_index::Column::StrategyId, Expr::value(Option::<String>::None))
        .filter(job_index::Column::JobId.eq(out.job_id.as_str()))
        .exec(h.db.as_ref())
        .await
        .unwrap();
    let row = JobIndexRepository::find(h.db.as_ref(), &out.job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(row.strategy_id.is_none());

    let page = h
        .service
        .list_jobs_for_strategy("demo", 10, 0, None)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.jobs[0].job_id, out.job_id);
    assert_eq!(page.jobs[0].strategy_id.as_deref(), Some("demo"));
    assert!(page.jobs[0].params.is_some());

    let page = h
        .service
        .list_jobs_for_strategy("other", 10, 0, None)
        .await
        .unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(
        h.service.strategy_job_ids("demo").await.unwrap(),
        vec![out.job_id.clone()]
    );
}

#[tokio::test]
async fn cleanup_removes_expired_runs_but_keeps_live_ones() {
    let h = harness(FakeLauncher::new(Behavior::Succeed)).await;
    h.save("demo").await;

    let old = h.service.submit(&request("demo")).await.unwrap();
    h.wait_terminal(&old.job_id).await;
    let mut req = request("demo");
    req.end_date = Some("2024-06-30".into());
    let fresh = h.service.submit(&req).await.unwrap();
    h.wait_terminal(&fresh.job_id).await;

    // 把已完成的任务挪进很早的日期分区，旁边放一个仍在运行的任务
    let expired = h.config.runs_dir().join("2000-01-01");
    std::fs::create_dir_all(&expired).unwrap();
    let row = JobIndexRepository::find(h.db.as_ref(), &old.job_id)
        .await
        .unwrap()
        .unwrap();
    std::fs::rename(&row.job_dir, expired.join(&old.job_id)).unwrap();
    let live_dir = expired.join("20000101-000000-live");
    std::fs::create_dir_all(&live_dir).unwrap();
    files::write_status(&live_dir, JobStatus::Running, None)
        .await
        .unwrap();

    let removed = h.service.cleanup_old_runs().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!expired.join(&old.job_id).exists());
    assert!(live_dir.exists());

    assert!(JobIndexRepository::find(h.db.as_ref(), &old.job_id)
        .await
        .unwrap()
        .is_none());
    let fingerprints = RunFingerprint::find()
        .filter(run_fingerprint::Column::JobId.eq(old.job_id.as_str()))
        .all(h.db.as_ref())
        .await
        .unwrap();
    assert!(fingerprints.is_empty());

    // 保留期内的任务不受影响
    let record = h.service.job_status(&fresh.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Finished);
    let fingerprints = RunFingerprint::find()
        .filter(run_fingerprint::Column::JobId.eq(fresh.job_id.as_str()))
        .all(h.db.as_ref())
        .await
        .unwrap();
    assert_eq!(fingerprints.len(), 1);

    // 第二次清理没有可删的
    assert_eq!(h.service.cleanup_old_runs().await.unwrap(), 0);
}

#[tokio::test]
async fn recover_fails_interrupted_jobs() {
    let h = harness(FakeLauncher::new(Behavior::WaitForCancel)).await;
    h.save("demo").await;

    let out = h.service.submit(&request("demo")).await.unwrap();
    h.wait_status(&out.job_id, JobStatus::Running).await;

    assert_eq!(h.service.recover().await.unwrap(), 1);
    let record = h.service.job_status(&out.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    let err = record.error.unwrap();
    assert_eq!(err.code, ERR_INTERNAL);
    assert!(err.message.contains("service restart"));

    let stats = h.service.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(h.service.recover().await.unwrap(), 0);
}
