pub mod fingerprint_repo;
pub mod job_repo;
pub mod rename_repo;

pub use fingerprint_repo::FingerprintRepository;
pub use job_repo::{JobIndexRepository, NewJob};
pub use rename_repo::RenameRepository;
