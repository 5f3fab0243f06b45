mod chunk;
mod coordinator;
mod dedup;
mod events;
mod integrity;
mod lock;
mod progress;
mod validator;

pub use coordinator::*;
pub use dedup::{DedupDecision, Deduplicator, FileKeyIndex};
pub use events::{EVENT_TARGET, EngineEvent};
pub use integrity::{
    CounterBackup, FileWitness, IntegrityVerdict, ResumptionMetadata, capture_witness,
    validate_resume_point, verify_witness,
};
pub use lock::{JobLock, LockManager, LockRegistry, MemoryLockRegistry};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use validator::{COUNTRY_CODES, CURRENCIES, REQUIRED_HEADERS, RecordValidator, Violation};

use common::JobId;
use thiserror::Error;

/// Engine-level failures. Row-scoped problems never surface here; they
/// are recorded to import_errors and counted. This enum is for conditions
/// that stop a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("reader: {0}")]
    Reader(#[from] reader::ReaderError),
    #[error("store: {0}")]
    Store(#[from] store::DataStoreError),
    #[error("missing required headers: {0}")]
    MissingHeaders(String),
    #[error("input exceeds configured limits: {0}")]
    LimitExceeded(String),
    #[error("invalid resumption point: {0}")]
    InvalidResumePoint(String),
    #[error("integrity verification refused resumption: {0}")]
    IntegrityRefused(String),
    #[error("processing lock lost for job {0}")]
    LockLost(JobId),
    #[error("no resumption backup recorded for job {0}")]
    NoBackup(JobId),
}

impl EngineError {
    /// Whether the Coordinator should transition the job to `failed`.
    /// Integrity refusals and lost locks leave the job exactly where it
    /// was: the file or another worker owns the next move, not this run.
    pub fn is_job_fatal(&self) -> bool {
        match self {
            EngineError::Reader(_)
            | EngineError::Store(_)
            | EngineError::MissingHeaders(_)
            | EngineError::LimitExceeded(_)
            | EngineError::InvalidResumePoint(_) => true,
            EngineError::IntegrityRefused(_)
            | EngineError::LockLost(_)
            | EngineError::NoBackup(_) => false,
        }
    }
}
