use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// 进程内的取消请求表。标记只写一次，任务进入终态后清除。
#[derive(Default)]
pub struct CancelRegistry {
    requests: Mutex<HashMap<String, DateTime<Utc>>>,
    watchers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 幂等；对不存在或已结束的任务也不报错
    pub fn request_cancel(&self, job_id: &str) {
        {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.entry(job_id.to_string()).or_insert_with(Utc::now);
        }
        let watcher = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned();
        if let Some(notify) = watcher {
            notify.notify_one();
        }
    }

    pub fn is_requested(&self, job_id: &str) -> bool {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
    }

    pub fn requested_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .copied()
    }

    /// 运行中的任务用它等待取消信号；订阅前已有请求时信号立即可用
    pub fn subscribe(&self, job_id: &str) -> Arc<Notify> {
        let notify = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        if self.is_requested(job_id) {
            notify.notify_one();
        }
        notify
    }

    pub fn clear(&self, job_id: &str) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn request_is_write_once() {
        let reg = CancelRegistry::new();
        reg.request_cancel("j1");
        let first = reg.requested_at("j1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        reg.request_cancel("j1");
        assert_eq!(reg.requested_at("j1"), Some(first));
        reg.clear("j1");
        assert!(!reg.is_requested("j1"));
    }

    #[tokio::test]
    async fn subscriber_wakes_on_request() {
        let reg = Arc::new(CancelRegistry::new());
        let notify = reg.subscribe("j1");
        let waiter = tokio::spawn(async move { notify.notified().await });
        reg.request_cancel("j1");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_sees_earlier_request() {
        let reg = CancelRegistry::new();
        reg.request_cancel("j1");
        let notify = reg.subscribe("j1");
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }
}
