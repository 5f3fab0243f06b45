use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{JobId, LockTuning, ResumptionEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use store::{DataStore, DataStoreError, ImportJobEntry, Persist, ResumptionLogEntry};
use uuid::Uuid;

/// Key holding the owner token for a job under processing.
fn processing_key(job_id: &JobId) -> String {
    format!("import_processing:{}", job_id)
}

/// Key holding renewal bookkeeping, kept past the lock itself so a
/// follow-up worker can see who held the job and until when.
fn meta_key(job_id: &JobId) -> String {
    format!("import_lock_meta:{}", job_id)
}

/// The shared TTL key-value registry the locks live in.
///
/// ### Intent:
/// One seam for anything with atomic set-if-absent and expiry. The
/// in-process [`MemoryLockRegistry`] serves a single host; a networked
/// implementation slots in behind the same trait for multi-host fleets.
#[async_trait]
pub trait LockRegistry: Send + Sync {
    /// Atomic claim: true only for the single caller that set the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool;

    async fn get(&self, key: &str) -> Option<String>;

    /// Unconditional write, used for renewal metadata.
    async fn put(&self, key: &str, value: &str, ttl: Duration);

    /// Compare-and-extend: refreshes the TTL only while `expected` still
    /// owns the key.
    async fn extend(&self, key: &str, expected: &str, ttl: Duration) -> bool;

    /// Compare-and-delete: releases only the caller's own claim.
    async fn remove(&self, key: &str, expected: &str) -> bool;
}

/// Single-process registry. Expiry is lazy: entries are dropped when the
/// next operation touches them past their deadline.
#[derive(Default)]
pub struct MemoryLockRegistry {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockRegistry for MemoryLockRegistry {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        let now = Instant::now();
        match entries.get(key) {
            Some((_, expires)) if *expires > now => false,
            _ => {
                entries.insert(key.to_string(), (value.to_string(), now + ttl));
                true
            }
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    async fn extend(&self, key: &str, expected: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((value, expires)) if *expires > now && value == expected => {
                *expires = now + ttl;
                true
            }
            _ => false,
        }
    }

    async fn remove(&self, key: &str, expected: &str) -> bool {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        match entries.get(key) {
            Some((value, _)) if value == expected => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Renewal bookkeeping stored next to the lock.
#[derive(Debug, Serialize, Deserialize)]
struct LockMeta {
    token: String,
    expires_at: String,
    timeout_seconds: u64,
}

/// A held processing lock. The token is the proof of ownership every
/// renewal and release is checked against.
#[derive(Clone, Debug)]
pub struct JobLock {
    pub job_id: JobId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub timeout: Duration,
}

/// Best-effort single-writer lock per job with an adaptive TTL.
pub struct LockManager {
    registry: std::sync::Arc<dyn LockRegistry>,
    tuning: LockTuning,
}

impl LockManager {
    pub fn new(registry: std::sync::Arc<dyn LockRegistry>, tuning: LockTuning) -> Self {
        Self { registry, tuning }
    }

    /// The adaptive timeout, recomputed on every acquire and renewal so it
    /// tracks the job's observed pace.
    pub fn compute_timeout(&self, job: &ImportJobEntry) -> Duration {
        let elapsed_minutes = job
            .started_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|started| {
                let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
                (elapsed.num_seconds().max(0) as f64) / 60.0
            });
        adaptive_timeout(
            job.total_rows.max(0) as u64,
            job.processed_rows.max(0) as u64,
            job.error_rows.max(0) as u64,
            elapsed_minutes,
            &self.tuning,
        )
    }

    /// Tries to claim the job. `None` means another worker holds it; the
    /// caller returns immediately rather than spinning.
    pub async fn acquire(
        &self,
        db: &DataStore,
        job: &ImportJobEntry,
        job_id: &JobId,
    ) -> Result<Option<JobLock>, DataStoreError> {
        let timeout = self.compute_timeout(job);
        let token = Uuid::new_v4().to_string();

        let claimed = self
            .registry
            .set_if_absent(&processing_key(job_id), &token, timeout)
            .await;

        if !claimed {
            db.store(ResumptionLogEntry::new(
                job_id,
                ResumptionEvent::LockRenewal,
                false,
                Some("acquire refused: lock held by another worker".to_string()),
                None,
            ))
            .await?;
            return Ok(None);
        }

        let lock = JobLock {
            job_id: *job_id,
            token,
            expires_at: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
            timeout,
        };
        self.write_meta(&lock).await;

        db.store(ResumptionLogEntry::new(
            job_id,
            ResumptionEvent::LockRenewal,
            true,
            Some(format!("acquired for {}s", timeout.as_secs())),
            None,
        ))
        .await?;

        Ok(Some(lock))
    }

    /// Renewal is due inside the window before expiry.
    pub fn needs_renewal(&self, lock: &JobLock) -> bool {
        let window = chrono::Duration::seconds(self.tuning.renewal_window_secs as i64);
        Utc::now() >= lock.expires_at - window
    }

    /// Re-runs the timeout calculation and extends the claim. `false` means
    /// the claim is gone (likely a concurrent takeover) and the holder
    /// must stop at the next chunk boundary.
    pub async fn renew(
        &self,
        db: &DataStore,
        job: &ImportJobEntry,
        lock: &mut JobLock,
    ) -> Result<bool, DataStoreError> {
        let timeout = self.compute_timeout(job);
        let extended = self
            .registry
            .extend(&processing_key(&lock.job_id), &lock.token, timeout)
            .await;

        if extended {
            lock.timeout = timeout;
            lock.expires_at = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();
            self.write_meta(lock).await;
        }

        db.store(ResumptionLogEntry::new(
            &lock.job_id,
            ResumptionEvent::LockRenewal,
            extended,
            Some(if extended {
                format!("renewed for {}s", timeout.as_secs())
            } else {
                "renewal failed: lock expired or taken over".to_string()
            }),
            None,
        ))
        .await?;

        Ok(extended)
    }

    /// Releases the claim if still owned. Safe to call after a lost lock.
    pub async fn release(&self, db: &DataStore, lock: &JobLock) -> Result<(), DataStoreError> {
        let released = self
            .registry
            .remove(&processing_key(&lock.job_id), &lock.token)
            .await;

        db.store(ResumptionLogEntry::new(
            &lock.job_id,
            ResumptionEvent::LockRenewal,
            released,
            Some(if released {
                "released".to_string()
            } else {
                "release skipped: no longer the holder".to_string()
            }),
            None,
        ))
        .await?;
        Ok(())
    }

    async fn write_meta(&self, lock: &JobLock) {
        let meta = LockMeta {
            token: lock.token.clone(),
            expires_at: lock.expires_at.to_rfc3339(),
            timeout_seconds: lock.timeout.as_secs(),
        };
        if let Ok(json) = serde_json::to_string(&meta) {
            let ttl = lock.timeout + Duration::from_secs(self.tuning.meta_grace_secs);
            self.registry.put(&meta_key(&lock.job_id), &json, ttl).await;
        }
    }
}

/// Timeout policy: a size-based floor, stretched when the observed rate
/// says the job needs longer, padded when the error rate is high (error
/// rows do extra writes), and clamped to sane operational bounds.
fn adaptive_timeout(
    total_rows: u64,
    processed_rows: u64,
    error_rows: u64,
    elapsed_minutes: Option<f64>,
    tuning: &LockTuning,
) -> Duration {
    let base_minutes: f64 = match total_rows {
        t if t > 50_000 => 120.0,
        t if t > 10_000 => 60.0,
        t if t > 1_000 => 30.0,
        _ => 15.0,
    };

    let mut minutes = base_minutes;
    if processed_rows > 0
        && let Some(elapsed) = elapsed_minutes
        && elapsed > 0.0
    {
        let rate = processed_rows as f64 / elapsed;
        if rate > 0.0 {
            let remaining = total_rows.saturating_sub(processed_rows) as f64 / rate;
            minutes = minutes.max(remaining * 1.5);
        }
    }

    if processed_rows > 0 {
        let error_rate = error_rows as f64 / processed_rows as f64;
        if error_rate > 0.10 {
            minutes *= 1.3;
        }
    }

    let secs = (minutes * 60.0) as u64;
    Duration::from_secs(secs.clamp(tuning.min_timeout_secs, tuning.max_timeout_secs))
}
