use crate::error::ServiceError;
use regex::Regex;
use std::sync::OnceLock;

pub const MAX_STRATEGY_ID_LEN: usize = 128;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // 字母（含中文）、组合符、数字、`_`、`-`、`.`
        Regex::new(r"^[\p{L}\p{M}\p{N}_.\-]+$").expect("static strategy id pattern")
    })
}

/// 去掉首尾空白并校验策略 id。错误信息以 `strategy_id` 开头，
/// 其他字段名用 [`normalize_field`]。
pub fn normalize_strategy_id(raw: &str) -> Result<String, ServiceError> {
    normalize_field(raw, "strategy_id")
}

pub fn normalize_field(raw: &str, field: &str) -> Result<String, ServiceError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ServiceError::invalid(format!("{} is empty", field)));
    }
    if id.chars().count() > MAX_STRATEGY_ID_LEN {
        return Err(ServiceError::invalid(format!(
            "{} must be at most {} characters",
            field, MAX_STRATEGY_ID_LEN
        )));
    }
    if !id_pattern().is_match(id) || id.chars().all(|c| c == '.') {
        return Err(ServiceError::invalid(format!(
            "{} contains invalid characters",
            field
        )));
    }
    Ok(id.to_string())
}

/// 读取外部写入的数据行时使用，不报错
pub fn is_valid_strategy_id(raw: &str) -> bool {
    raw == raw.trim() && normalize_strategy_id(raw).is_ok()
}
