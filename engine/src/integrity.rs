use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};

/// The witness captured when processing first touches a file. Equality of
/// size and hash is what later resumption is gated on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileWitness {
    pub size: u64,
    /// 64-hex SHA-256 of the full byte content.
    pub hash: String,
    /// RFC 3339 modification time.
    pub modified: String,
}

/// Streams the file through SHA-256 in fixed-size reads; memory use is
/// independent of file size.
pub fn capture_witness(path: &Utf8Path) -> io::Result<FileWitness> {
    let metadata = std::fs::metadata(path.as_std_path())?;
    let modified: DateTime<Utc> = metadata.modified()?.into();

    let mut file = File::open(path.as_std_path())?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(FileWitness {
        size: metadata.len(),
        hash: format!("{:x}", hasher.finalize()),
        modified: modified.to_rfc3339_opts(SecondsFormat::Micros, true),
    })
}

/// Outcome of comparing the recorded witness against the file on disk.
#[derive(Clone, Debug)]
pub enum IntegrityVerdict {
    /// Bytes unchanged. A drifted mtime alone is a warning, not a failure:
    /// copies and touch-style tooling move it without touching content.
    Match { mtime_changed: bool },
    Mismatch { detail: String },
}

impl IntegrityVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, IntegrityVerdict::Match { .. })
    }
}

pub fn verify_witness(
    recorded_size: u64,
    recorded_hash: &str,
    recorded_modified: Option<&str>,
    actual: &FileWitness,
) -> IntegrityVerdict {
    if actual.size != recorded_size {
        return IntegrityVerdict::Mismatch {
            detail: format!(
                "file size changed: recorded {} bytes, found {} bytes",
                recorded_size, actual.size
            ),
        };
    }
    if actual.hash != recorded_hash {
        return IntegrityVerdict::Mismatch {
            detail: format!(
                "file hash changed: recorded {}, found {}",
                recorded_hash, actual.hash
            ),
        };
    }

    let mtime_changed = recorded_modified.is_some_and(|m| m != actual.modified);
    IntegrityVerdict::Match { mtime_changed }
}

/// Counter snapshot taken before a resumption touches anything, so an
/// operator can rewind a wedged job to its pre-resume state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CounterBackup {
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub error_rows: i64,
    pub last_processed_row: i64,
    pub created_at: String,
}

/// The opaque `resumption_metadata` map on the job row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResumptionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<CounterBackup>,
    /// Free-form integrity notes ("legacy calculated", mtime warnings).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity_note: Option<String>,
}

impl ResumptionMetadata {
    pub fn parse(raw: Option<&str>) -> Self {
        raw.and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Checks a requested resumption offset against the known row count.
/// Rewinding below the checkpoint is legal but reported, since the rewound
/// rows will be read again.
pub fn validate_resume_point(
    resume_from_row: u64,
    last_processed_row: u64,
    total_rows: u64,
) -> Result<Option<String>, String> {
    if resume_from_row > total_rows {
        return Err(format!(
            "resume point {} is beyond the file's {} data rows",
            resume_from_row, total_rows
        ));
    }
    if resume_from_row < last_processed_row {
        return Ok(Some(format!(
            "resume point {} is before checkpoint {}; rows in between will be reprocessed",
            resume_from_row, last_processed_row
        )));
    }
    Ok(None)
}
