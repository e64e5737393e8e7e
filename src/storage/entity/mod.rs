pub mod job_index;
pub mod run_fingerprint;
pub mod strategy_rename;

pub use job_index::Entity as JobIndex;
pub use run_fingerprint::Entity as RunFingerprint;
pub use strategy_rename::Entity as StrategyRename;
