use chrono::{DateTime, SecondsFormat, Utc};
use common::JobId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use store::{DataStore, DataStoreError, Fetch, ImportJobEntry};

/// The externally visible progress view of one job.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub status: String,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub error_rows: i64,
    pub last_processed_row: i64,
    /// processed/total as a percentage, two decimals. 0 when total is 0.
    pub percentage: f64,
    /// Rows per minute since `started_at`.
    pub processing_rate: f64,
    /// RFC 3339 projection; absent when the rate is 0 or the job is done.
    pub estimated_completion: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Per-job cached snapshots over the durable counters.
///
/// The chunk transaction owns the counter writes; this tracker only reads,
/// computes the derived fields, and caches the result so status polling
/// does not hammer the store.
pub struct ProgressTracker {
    cache: Mutex<HashMap<String, (ProgressSnapshot, Instant)>>,
    ttl: Duration,
}

impl ProgressTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached snapshot, recomputed from the durable row when cold.
    pub async fn get(
        &self,
        db: &DataStore,
        job_id: &JobId,
    ) -> Result<ProgressSnapshot, DataStoreError> {
        let key = job_id.to_string();
        if let Ok(cache) = self.cache.lock()
            && let Some((snapshot, cached_at)) = cache.get(&key)
            && cached_at.elapsed() < self.ttl
        {
            return Ok(snapshot.clone());
        }

        let entry = db.fetch_by(job_id).await?;
        Ok(self.refresh(&entry))
    }

    /// Recomputes and caches the snapshot from a fresh job row. Called at
    /// every chunk boundary and on terminal transitions.
    pub fn refresh(&self, entry: &ImportJobEntry) -> ProgressSnapshot {
        let snapshot = compute_snapshot(entry, Utc::now());
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(entry.id.clone(), (snapshot.clone(), Instant::now()));
        }
        snapshot
    }

    pub fn invalidate(&self, job_id: &JobId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&job_id.to_string());
        }
    }
}

fn compute_snapshot(entry: &ImportJobEntry, now: DateTime<Utc>) -> ProgressSnapshot {
    let percentage = if entry.total_rows > 0 {
        let raw = entry.processed_rows as f64 / entry.total_rows as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    } else {
        0.0
    };

    let terminal = entry
        .job_status()
        .map(|s| s.is_terminal())
        .unwrap_or(false);

    // Rate window: started_at up to completion (or now for live jobs).
    // Sub-minute jobs fall back to a seconds-based rate scaled to minutes,
    // which avoids the divide-by-almost-zero spike right after start.
    let end = entry
        .completed_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);
    let processing_rate = entry
        .started_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|started| {
            let elapsed_secs = end
                .signed_duration_since(started.with_timezone(&Utc))
                .num_seconds()
                .max(1) as f64;
            let per_minute = entry.processed_rows as f64 * 60.0 / elapsed_secs;
            (per_minute * 100.0).round() / 100.0
        })
        .unwrap_or(0.0);

    let estimated_completion = if terminal
        || processing_rate <= 0.0
        || entry.total_rows <= entry.processed_rows
    {
        None
    } else {
        let remaining = (entry.total_rows - entry.processed_rows) as f64;
        let minutes_left = remaining / processing_rate;
        let eta = now + chrono::Duration::seconds((minutes_left * 60.0) as i64);
        Some(eta.to_rfc3339_opts(SecondsFormat::Secs, true))
    };

    ProgressSnapshot {
        job_id: entry.id.clone(),
        status: entry.status.clone(),
        total_rows: entry.total_rows,
        processed_rows: entry.processed_rows,
        successful_rows: entry.successful_rows,
        error_rows: entry.error_rows,
        last_processed_row: entry.last_processed_row,
        percentage,
        processing_rate,
        estimated_completion,
        started_at: entry.started_at.clone(),
        completed_at: entry.completed_at.clone(),
    }
}
