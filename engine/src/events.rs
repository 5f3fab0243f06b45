use serde::Serialize;

/// Log target the JSON event lines go to. Shipping is external: whatever
/// logger the host wires up decides where these end up.
pub const EVENT_TARGET: &str = "rosterd::events";

/// Structured events the engine emits. One JSON line each, with the job id
/// and a UTC timestamp stamped on at emission.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent<'a> {
    JobStarted {
        job_id: &'a str,
        filename: &'a str,
        total_rows: i64,
        resumed_from_row: i64,
    },
    JobCompleted {
        job_id: &'a str,
        processed_rows: i64,
        successful_rows: i64,
        error_rows: i64,
        duration_secs: Option<i64>,
    },
    JobFailed {
        job_id: &'a str,
        reason: &'a str,
    },
    ChunkProcessed {
        job_id: &'a str,
        first_row: u64,
        last_row: u64,
        rows: usize,
        duration_ms: u128,
        chunk_size: usize,
    },
    ValidationErrors {
        job_id: &'a str,
        first_row: u64,
        last_row: u64,
        count: u64,
    },
    DuplicateDetection {
        job_id: &'a str,
        first_row: u64,
        last_row: u64,
        count: u64,
    },
    MemoryWarning {
        job_id: &'a str,
        resident_mb: u64,
        limit_mb: u64,
        chunk_size: usize,
    },
    IntegrityCheck {
        job_id: &'a str,
        passed: bool,
        details: &'a str,
    },
    LockRenewal {
        job_id: &'a str,
        renewed: bool,
        timeout_secs: u64,
    },
    ResumptionAttempt {
        job_id: &'a str,
        resume_from_row: i64,
    },
    ResumptionSuccess {
        job_id: &'a str,
        resumed_from_row: i64,
    },
    ResumptionFailure {
        job_id: &'a str,
        reason: &'a str,
    },
}

/// Serializes and emits one event line. Emission must never take a job
/// down, so serialization problems degrade to a warning.
pub fn emit(event: &EngineEvent<'_>) {
    match serde_json::to_value(event) {
        Ok(mut value) => {
            if let Some(map) = value.as_object_mut() {
                map.insert(
                    "ts".to_string(),
                    serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
                );
            }
            log::info!(target: EVENT_TARGET, "{}", value);
        }
        Err(err) => log::warn!(target: EVENT_TARGET, "unserializable event: {}", err),
    }
}
