mod config;
pub use config::*;

use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref, str::FromStr};
use uuid::Uuid;

/// 1-based index of a data row (the header row is not counted).
pub type RowNumber = u64;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for JobId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Uuid> for JobId {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0.to_string().as_str()))
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobId(Uuid::parse_str(s)?))
    }
}

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

/// Lifecycle of an import job. Terminal states are `Completed` and `Failed`;
/// a failed job re-enters the queue only through an explicit restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Classification of a row-scoped import error.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Duplicate,
    Format,
    BusinessRule,
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Format => "format",
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::System => "system",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "duplicate" => Ok(ErrorKind::Duplicate),
            "format" => Ok(ErrorKind::Format),
            "business_rule" => Ok(ErrorKind::BusinessRule),
            "system" => Ok(ErrorKind::System),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Outcome of one data row in the per-job dedup ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Processed,
    Skipped,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Processed => "processed",
            RecordStatus::Skipped => "skipped",
            RecordStatus::Error => "error",
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(RecordStatus::Processed),
            "skipped" => Ok(RecordStatus::Skipped),
            "error" => Ok(RecordStatus::Error),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Event types recorded in the append-only resumption audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumptionEvent {
    IntegrityCheck,
    LockRenewal,
    ResumptionAttempt,
    ResumptionSuccess,
    ResumptionFailure,
}

impl ResumptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumptionEvent::IntegrityCheck => "integrity_check",
            ResumptionEvent::LockRenewal => "lock_renewal",
            ResumptionEvent::ResumptionAttempt => "resumption_attempt",
            ResumptionEvent::ResumptionSuccess => "resumption_success",
            ResumptionEvent::ResumptionFailure => "resumption_failure",
        }
    }
}

impl Display for ResumptionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("unknown variant: {}", self.0))
    }
}

impl std::error::Error for UnknownVariant {}
