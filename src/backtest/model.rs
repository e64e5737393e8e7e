use crate::error::{ServiceError, ServiceResult};
use crate::strategy::id::normalize_strategy_id;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const ERR_JOB_CANCELLED: &str = "JOB_CANCELLED";
pub const ERR_EXIT_NONZERO: &str = "RQALPHA_EXIT_NONZERO";
pub const ERR_TIMEOUT: &str = "RQALPHA_TIMEOUT";
pub const ERR_RESULT_MISSING: &str = "RESULT_FILE_MISSING";
pub const ERR_INTERNAL: &str = "INTERNAL_ERROR";

pub const DEFAULT_CASH: f64 = 100_000.0;
pub const DEFAULT_BENCHMARK: &str = "000300.XSHG";
pub const DEFAULT_FREQUENCY: &str = "1d";
pub const MAX_LIST_LIMIT: u64 = 1000;
pub const MAX_PAGE_SIZE: usize = 1000;
pub const MAX_LOG_TAIL: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态只能前进：QUEUED -> RUNNING -> 终态。QUEUED 也可直接进入终态（取消/启动失败）。
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => next != JobStatus::Queued,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        JobStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let valid: Vec<&str> = JobStatus::ALL.iter().map(|st| st.as_str()).collect();
                ServiceError::invalid(format!("status must be one of: {}", valid.join(", ")))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ERR_JOB_CANCELLED, "job cancelled by user")
    }
}

/// 任务目录下 status.json 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobStatus,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// 提交回测的原始请求，字段都可缺省，由 `validate` 统一校验并补默认值
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub strategy_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub cash: Option<f64>,
    pub benchmark: Option<String>,
    pub frequency: Option<String>,
}

impl RunRequest {
    pub fn validate(&self, allowed_frequencies: &BTreeSet<String>) -> ServiceResult<(String, RunParams)> {
        let missing: Vec<&str> = [
            ("strategy_id", &self.strategy_id),
            ("start_date", &self.start_date),
            ("end_date", &self.end_date),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().map(str::is_empty).unwrap_or(true))
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(ServiceError::invalid(format!(
                "missing fields: {}",
                missing.join(", ")
            )));
        }

        let strategy_id = normalize_strategy_id(self.strategy_id.as_deref().unwrap_or_default())?;
        let start_date = parse_date("start_date", self.start_date.as_deref().unwrap_or_default())?;
        let end_date = parse_date("end_date", self.end_date.as_deref().unwrap_or_default())?;
        if end_date < start_date {
            return Err(ServiceError::invalid("end_date must be >= start_date"));
        }

        let cash = self.cash.unwrap_or(DEFAULT_CASH);
        if !cash.is_finite() {
            return Err(ServiceError::invalid("cash must be a number"));
        }
        if cash <= 0.0 {
            return Err(ServiceError::invalid("cash must be > 0"));
        }

        let benchmark = self
            .benchmark
            .as_deref()
            .unwrap_or(DEFAULT_BENCHMARK)
            .trim()
            .to_string();
        if benchmark.is_empty() {
            return Err(ServiceError::invalid("benchmark must be a non-empty string"));
        }

        let frequency = self
            .frequency
            .as_deref()
            .unwrap_or(DEFAULT_FREQUENCY)
            .trim()
            .to_string();
        if frequency.is_empty() {
            return Err(ServiceError::invalid("frequency must be a non-empty string"));
        }
        if !allowed_frequencies.contains(&frequency) {
            let allowed: Vec<&str> = allowed_frequencies.iter().map(String::as_str).collect();
            return Err(ServiceError::invalid(format!(
                "frequency must be one of: {}",
                allowed.join(", ")
            )));
        }

        Ok((
            strategy_id,
            RunParams {
                start_date,
                end_date,
                cash,
                benchmark,
                frequency,
            },
        ))
    }
}

fn parse_date(field: &str, raw: &str) -> ServiceResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ServiceError::invalid(format!("{} must be in YYYY-MM-DD format", field)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(serialize_with = "serialize_cash")]
    pub cash: f64,
    pub benchmark: String,
    pub frequency: String,
}

/// 整数金额按整数输出（100000 而不是 100000.0），指纹与 meta.json 依赖这一点
pub fn cash_value(cash: f64) -> Value {
    if cash.fract() == 0.0 && cash.abs() < 9.0e15 {
        Value::from(cash as i64)
    } else {
        Value::from(cash)
    }
}

fn serialize_cash<S: Serializer>(cash: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    cash_value(*cash).serialize(serializer)
}

/// meta.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub strategy_id: String,
    #[serde(flatten)]
    pub params: RunParams,
    pub code_sha256: String,
}

/// 列表中的单个任务
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub strategy_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub params: Option<RunParams>,
    pub error: Option<JobError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub strategy_id: String,
    pub jobs: Vec<JobSummary>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub job_id: String,
    /// 命中幂等窗口，返回的是已有任务
    #[serde(skip)]
    pub reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWindow {
    Full,
    /// 从字节偏移开始读到末尾
    Offset(u64),
    /// 最后 N 字节，1..=1 MiB
    Tail(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSlice {
    pub content: String,
    pub offset: u64,
    pub next_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Equity {
    pub dates: Vec<Value>,
    pub nav: Vec<Value>,
    pub returns: Vec<Value>,
    pub benchmark_nav: Vec<Value>,
}

/// 归一化之后的回测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub summary: Map<String, Value>,
    pub equity: Equity,
    pub trades: Vec<Value>,
    pub trade_columns: Vec<String>,
    pub raw_keys: Vec<String>,
    pub trades_total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

const NAV_SERIES_KEYS: [&str; 5] = ["benchmark_nav", "nav", "unit_net_value", "values", "curve"];
const BENCHMARK_FALLBACK_KEYS: [&str; 4] = [
    "benchmark_nav",
    "benchmark_curve",
    "benchmark_equity",
    "benchmark_portfolio",
];

fn list_of(v: Option<&Value>) -> Vec<Value> {
    match v {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// 净值序列可能直接是数组，也可能包在对象里
fn nav_series(v: Option<&Value>) -> Vec<Value> {
    match v {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(obj)) => NAV_SERIES_KEYS
            .iter()
            .find_map(|k| match obj.get(*k) {
                Some(Value::Array(items)) => Some(items.clone()),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn value_to_column(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ResultDocument {
    /// 缺失或类型不对的部分一律置空，不报错
    pub fn from_value(payload: &Value) -> Self {
        let empty = Map::new();
        let obj = payload.as_object().unwrap_or(&empty);

        let summary = match obj.get("summary") {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };

        let equity_obj = obj.get("equity").and_then(Value::as_object);
        let get_eq = |k: &str| equity_obj.and_then(|e| e.get(k));
        let mut benchmark_nav = nav_series(get_eq("benchmark_nav"));
        if benchmark_nav.is_empty() {
            benchmark_nav = BENCHMARK_FALLBACK_KEYS
                .iter()
                .map(|k| nav_series(obj.get(*k)))
                .find(|series| !series.is_empty())
                .unwrap_or_default();
        }
        let equity = Equity {
            dates: list_of(get_eq("dates")),
            nav: list_of(get_eq("nav")),
            returns: list_of(get_eq("returns")),
            benchmark_nav,
        };

        let trades = list_of(obj.get("trades"));
        let trade_columns = match obj.get("trade_columns") {
            Some(Value::Array(cols)) => cols.iter().map(value_to_column).collect(),
            _ => match trades.first() {
                Some(Value::Object(first)) => first.keys().cloned().collect(),
                _ => Vec::new(),
            },
        };
        let raw_keys = match obj.get("raw_keys") {
            Some(Value::Array(keys)) => keys.iter().map(value_to_column).collect(),
            _ => {
                let mut keys: Vec<String> = obj.keys().cloned().collect();
                keys.sort();
                keys
            }
        };

        let trades_total = trades.len();
        Self {
            summary,
            equity,
            trades,
            trade_columns,
            raw_keys,
            trades_total,
            page: None,
            page_size: None,
        }
    }

    /// 成交记录分页，`trades_total` 保持为总数
    pub fn paginate(&mut self, page: usize, page_size: usize) -> ServiceResult<()> {
        if page < 1 {
            return Err(ServiceError::invalid("page must be >= 1"));
        }
        if page_size < 1 {
            return Err(ServiceError::invalid("page_size must be >= 1"));
        }
        if page_size > MAX_PAGE_SIZE {
            return Err(ServiceError::invalid(format!(
                "page_size must be <= {}",
                MAX_PAGE_SIZE
            )));
        }
        let start = (page - 1).saturating_mul(page_size).min(self.trades.len());
        let end = start.saturating_add(page_size).min(self.trades.len());
        self.trades = self.trades[start..end].to_vec();
        self.page = Some(page);
        self.page_size = Some(page_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn daily() -> BTreeSet<String> {
        BTreeSet::from(["1d".to_string()])
    }

    fn request(start: &str, end: &str) -> RunRequest {
        RunRequest {
            strategy_id: Some("demo".into()),
            start_date: Some(start.into()),
            end_date: Some(end.into()),
            ..Default::default()
        }
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Finished));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Finished, Failed, Cancelled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn unknown_status_lists_valid_set() {
        let err = "DONE".parse::<JobStatus>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "status must be one of: QUEUED, RUNNING, FINISHED, FAILED, CANCELLED"
        );
        assert_eq!("finished".parse::<JobStatus>().unwrap(), JobStatus::Finished);
    }

    #[test]
    fn run_request_defaults_are_applied() {
        let (id, params) = request("2024-01-01", "2024-06-30").validate(&daily()).unwrap();
        assert_eq!(id, "demo");
        assert_eq!(params.cash, DEFAULT_CASH);
        assert_eq!(params.benchmark, DEFAULT_BENCHMARK);
        assert_eq!(params.frequency, "1d");
    }

    #[test]
    fn run_request_rejects_bad_input() {
        let err = RunRequest::default().validate(&daily()).unwrap_err();
        assert_eq!(err.to_string(), "missing fields: strategy_id, start_date, end_date");

        let err = request("2024-06-30", "2024-01-01").validate(&daily()).unwrap_err();
        assert_eq!(err.to_string(), "end_date must be >= start_date");

        let err = request("2024/01/01", "2024-06-30").validate(&daily()).unwrap_err();
        assert_eq!(err.to_string(), "start_date must be in YYYY-MM-DD format");

        let mut req = request("2024-01-01", "2024-06-30");
        req.cash = Some(0.0);
        assert_eq!(req.validate(&daily()).unwrap_err().to_string(), "cash must be > 0");

        let mut req = request("2024-01-01", "2024-06-30");
        req.frequency = Some("1m".into());
        assert_eq!(
            req.validate(&daily()).unwrap_err().to_string(),
            "frequency must be one of: 1d"
        );
    }

    #[test]
    fn whole_cash_serializes_as_integer() {
        assert_eq!(cash_value(100000.0), json!(100000));
        assert_eq!(cash_value(1234.5), json!(1234.5));
        let (_, params) = request("2024-01-01", "2024-01-02").validate(&daily()).unwrap();
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["cash"], json!(100000));
        assert_eq!(v["start_date"], json!("2024-01-01"));
    }

    #[test]
    fn result_normalization_fills_gaps() {
        let doc = ResultDocument::from_value(&json!({
            "summary": {"total_returns": 0.12},
            "equity": {"dates": ["2024-01-02"], "nav": [1.0]},
            "benchmark_curve": {"unit_net_value": [1.0]},
            "trades": [{"datetime": "2024-01-02", "order_book_id": "000001.XSHE"}],
        }));
        assert_eq!(doc.equity.benchmark_nav, vec![json!(1.0)]);
        assert!(doc.equity.returns.is_empty());
        assert_eq!(doc.trade_columns, vec!["datetime", "order_book_id"]);
        assert_eq!(doc.raw_keys, vec!["benchmark_curve", "equity", "summary", "trades"]);
        assert_eq!(doc.trades_total, 1);

        let empty = ResultDocument::from_value(&json!("not an object"));
        assert!(empty.summary.is_empty() && empty.trades.is_empty());
    }

    #[test]
    fn pagination_keeps_total() {
        let trades: Vec<Value> = (0..5).map(|i| json!({"i": i})).collect();
        let mut doc = ResultDocument::from_value(&json!({ "trades": trades }));
        doc.paginate(2, 2).unwrap();
        assert_eq!(doc.trades, vec![json!({"i": 2}), json!({"i": 3})]);
        assert_eq!(doc.trades_total, 5);

        let mut doc = ResultDocument::from_value(&json!({ "trades": [] }));
        doc.paginate(3, 10).unwrap();
        assert!(doc.trades.is_empty());
        assert!(doc.paginate(1, 1001).is_err());
        assert!(doc.paginate(0, 10).is_err());
    }
}
