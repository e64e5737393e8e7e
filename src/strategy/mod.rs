pub mod compile;
pub mod graph;
pub mod id;
pub mod rename;
pub mod service;
pub mod source;

pub use compile::{CheckOutput, CompileKind, CompileReport, PythonChecker, StrategyChecker};
pub use graph::{GraphWriteGuard, RenameGraph, UpsertOutcome};
pub use id::normalize_strategy_id;
pub use service::{DeleteOutcome, RenameOutcome, StrategyDetail, StrategyPage, StrategyService};
pub use source::{CodeSource, FileCodeSource, StrategyMeta};
