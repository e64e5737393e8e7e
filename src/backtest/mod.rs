pub mod cancel;
pub mod extractor;
pub mod files;
pub mod fingerprint;
pub mod model;
pub mod service;
pub mod worker;

pub use cancel::CancelRegistry;
pub use extractor::{CommandExtractor, ResultExtractor};
pub use model::{JobError, JobStatus, RunRequest};
pub use service::BacktestService;
pub use worker::{BacktestLauncher, ProcessExit, RqalphaLauncher};
