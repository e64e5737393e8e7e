use log::error;
use serde::Serialize;

/// 冲突类错误：调用方需要修改请求，原样重试不会成功
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictError {
    #[error("rename would create a cycle: {from_id} -> {to_id}")]
    RenameCycle { from_id: String, to_id: String },
    #[error("rename target already exists: {to_id}")]
    RenameConflict { to_id: String },
    #[error("strategy is referenced by existing jobs")]
    StrategyReferenced {
        strategy_id: String,
        job_ids: Vec<String>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("result not ready")]
    ResultNotReady {
        status: String,
        detail: Option<String>,
    },
    #[error("internal error")]
    Internal(String),
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// 完整细节写日志并保留，`Display` 只输出通用文字
    pub fn internal(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        error!("内部错误: {}", detail);
        Self::Internal(detail)
    }

    /// 稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::ResultNotReady { .. } => "RESULT_NOT_READY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sea_orm::DbErr> for ServiceError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::internal(format!("database: {}", err))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("io: {}", err))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("json: {}", err))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
