use crate::backtest::model::{cash_value, RunParams};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const FINGERPRINT_VERSION: &str = "RUNFP_V1";

pub fn code_sha256(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// 同一策略、同一参数、同一份源码得到相同指纹。键按字典序序列化。
pub fn build_run_fingerprint(strategy_id: &str, params: &RunParams, code: &str) -> String {
    let mut payload: BTreeMap<&str, Value> = BTreeMap::new();
    payload.insert("strategy_id", Value::from(strategy_id));
    payload.insert("start_date", Value::from(params.start_date.to_string()));
    payload.insert("end_date", Value::from(params.end_date.to_string()));
    payload.insert("cash", cash_value(params.cash));
    payload.insert("benchmark", Value::from(params.benchmark.as_str()));
    payload.insert("frequency", Value::from(params.frequency.as_str()));
    payload.insert("code_sha256", Value::from(code_sha256(code)));

    // BTreeMap 序列化不会失败
    let canonical = serde_json::to_string(&payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
