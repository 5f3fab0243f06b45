use crate::EngineError;
use crate::chunk::ChunkEngine;
use crate::dedup::{Deduplicator, FileKeyIndex};
use crate::events::{self, EngineEvent};
use crate::integrity::{
    CounterBackup, ResumptionMetadata, capture_witness, validate_resume_point, verify_witness,
};
use crate::lock::{JobLock, LockManager, LockRegistry};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::validator::{REQUIRED_HEADERS, RecordValidator};
use camino::Utf8Path;
use chrono::DateTime;
use common::{ImportConfig, JobId, JobStatus, ResumptionEvent};
use reader::RowReader;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use store::{
    DataStore, ErrorPage, ErrorQuery, Fetch, ImportJobEntry, LedgerReport, Persist,
    ResumptionLogEntry, now_rfc3339,
};

/// What a `start_or_resume` call did.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// The run finished and the job is completed.
    Completed,
    /// The job was already completed; re-entry is a no-op.
    AlreadyComplete,
    /// The job failed on a previous run. Failed is terminal; it re-enters
    /// the queue only through an explicit restore.
    AlreadyFailed,
    /// Another worker holds the processing lock; nothing was touched.
    LockHeld,
}

/// Job-level summary for the out-of-scope summary endpoint.
#[derive(Debug, Serialize)]
pub struct ImportSummary {
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    pub filename: String,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub failure_reason: Option<String>,
    /// `(error_type, count)` pairs, alphabetical.
    pub error_counts: Vec<(String, i64)>,
    pub duration_secs: Option<i64>,
}

/// The job lifecycle state machine and the service surface the worker and
/// the (out-of-scope) HTTP layer call into.
///
/// One instance serves many jobs; all per-job mutable state lives inside a
/// single `start_or_resume` call, under that job's processing lock.
pub struct ImportService {
    db: Arc<DataStore>,
    config: ImportConfig,
    locks: LockManager,
    progress: ProgressTracker,
    validator: RecordValidator,
}

impl ImportService {
    pub fn new(
        db: Arc<DataStore>,
        registry: Arc<dyn LockRegistry>,
        config: ImportConfig,
    ) -> Self {
        let locks = LockManager::new(registry, config.lock);
        let progress = ProgressTracker::new(Duration::from_secs(config.progress_cache_ttl_secs));
        let validator =
            RecordValidator::new(Duration::from_secs(config.validation_cache_ttl_secs));
        Self {
            db,
            config,
            locks,
            progress,
            validator,
        }
    }

    /// Registers an uploaded file as a pending job. Upload handling itself
    /// (multipart, auth) lives outside the engine; this is the constructor
    /// it calls once the file is on disk.
    pub async fn create_job(&self, filename: &str, file_path: &str) -> Result<JobId, EngineError> {
        let job_id = JobId::new();
        self.db
            .store(ImportJobEntry::new_pending(&job_id, filename, file_path))
            .await?;
        Ok(job_id)
    }

    /// Entry point for workers. Acquires the job's lock, verifies or
    /// captures file integrity, resumes from the checkpoint when one
    /// exists, and drives the chunk loop to a terminal state.
    pub async fn start_or_resume(&self, job_id: &JobId) -> Result<StartOutcome, EngineError> {
        let job = self.db.fetch_by(job_id).await?;
        match job.job_status()? {
            JobStatus::Completed => {
                log::debug!("job {} already completed; start_or_resume is a no-op", job_id);
                return Ok(StartOutcome::AlreadyComplete);
            }
            JobStatus::Failed => {
                log::debug!("job {} is failed; restore it before retrying", job_id);
                return Ok(StartOutcome::AlreadyFailed);
            }
            JobStatus::Pending | JobStatus::Processing => {}
        }

        let Some(mut lock) = self.locks.acquire(&self.db, &job, job_id).await? else {
            log::debug!("job {} is held by another worker", job_id);
            return Ok(StartOutcome::LockHeld);
        };

        let result = self.run_locked(job_id, &mut lock).await;

        if let Err(release_err) = self.locks.release(&self.db, &lock).await {
            log::warn!("lock release failed for job {}: {}", job_id, release_err);
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_job_fatal() => {
                let reason = err.to_string();
                match self.db.mark_job_failed(job_id, &reason).await {
                    Ok(()) => {
                        self.progress.invalidate(job_id);
                        events::emit(&EngineEvent::JobFailed {
                            job_id: &job_id.to_string(),
                            reason: &reason,
                        });
                    }
                    Err(store_err) => {
                        log::error!("could not mark job {} failed: {}", job_id, store_err)
                    }
                }
                Err(err)
            }
            // Integrity refusals and lost locks leave the job untouched.
            Err(err) => Err(err),
        }
    }

    async fn run_locked(
        &self,
        job_id: &JobId,
        lock: &mut JobLock,
    ) -> Result<StartOutcome, EngineError> {
        // Re-read under the lock: the pre-lock snapshot may be stale.
        let mut job = self.db.fetch_by(job_id).await?;
        match job.job_status()? {
            JobStatus::Completed => return Ok(StartOutcome::AlreadyComplete),
            JobStatus::Failed => return Ok(StartOutcome::AlreadyFailed),
            JobStatus::Pending | JobStatus::Processing => {}
        }

        let path = self.config.resolve_file_path(&job.file_path);
        let resuming = job.is_resumable();
        let job_key = job.id.clone();

        if resuming {
            self.db
                .store(ResumptionLogEntry::new(
                    job_id,
                    ResumptionEvent::ResumptionAttempt,
                    true,
                    Some(format!("resuming after row {}", job.last_processed_row)),
                    None,
                ))
                .await?;
            events::emit(&EngineEvent::ResumptionAttempt {
                job_id: &job_key,
                resume_from_row: job.last_processed_row,
            });

            self.verify_for_resumption(job_id, &mut job, &path).await?;

            if job.total_rows > 0 {
                match validate_resume_point(
                    job.last_processed_row as u64,
                    job.last_processed_row as u64,
                    job.total_rows as u64,
                ) {
                    Err(detail) => return Err(EngineError::InvalidResumePoint(detail)),
                    Ok(Some(advisory)) => log::warn!("job {}: {}", job_id, advisory),
                    Ok(None) => {}
                }
            }

            // Snapshot the counters so an operator can rewind this attempt.
            let mut metadata = ResumptionMetadata::parse(job.resumption_metadata.as_deref());
            metadata.backup = Some(CounterBackup {
                processed_rows: job.processed_rows,
                successful_rows: job.successful_rows,
                error_rows: job.error_rows,
                last_processed_row: job.last_processed_row,
                created_at: now_rfc3339(),
            });
            self.db
                .set_resumption_metadata(job_id, Some(&metadata.to_json()))
                .await?;
        } else {
            let witness = capture_witness(&path).map_err(reader::ReaderError::Io)?;
            if witness.size > self.config.max_file_size {
                return Err(EngineError::LimitExceeded(format!(
                    "file is {} bytes, limit is {}",
                    witness.size, self.config.max_file_size
                )));
            }
            self.db
                .set_file_witness(job_id, witness.size as i64, &witness.hash, &witness.modified)
                .await?;
            self.db
                .store(ResumptionLogEntry::new(
                    job_id,
                    ResumptionEvent::IntegrityCheck,
                    true,
                    Some("witness captured at first processing".to_string()),
                    Some(format!(
                        r#"{{"size":{},"hash":"{}"}}"#,
                        witness.size, witness.hash
                    )),
                ))
                .await?;
        }

        // Dedicated full pass: data-row count plus the keep-last index.
        // Persisted before the first record is processed.
        let (headers, total_rows, file_index) = survey(&path)?;

        let missing: Vec<&str> = REQUIRED_HEADERS
            .iter()
            .copied()
            .filter(|required| !headers.iter().any(|h| h == required))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::MissingHeaders(missing.join(", ")));
        }

        if total_rows > self.config.max_rows {
            return Err(EngineError::LimitExceeded(format!(
                "file has {} data rows, limit is {}",
                total_rows, self.config.max_rows
            )));
        }

        if job.total_rows == 0 && total_rows > 0 {
            self.db.set_total_rows(job_id, total_rows as i64).await?;
        }

        let mut dedup = Deduplicator::new();
        if resuming {
            dedup.rebuild_tracking_state(&self.db, job_id).await?;
        }

        self.db.mark_job_processing(job_id).await?;
        let job = self.db.fetch_by(job_id).await?;
        self.progress.refresh(&job);

        events::emit(&EngineEvent::JobStarted {
            job_id: &job_key,
            filename: &job.filename,
            total_rows: job.total_rows,
            resumed_from_row: job.last_processed_row,
        });
        if resuming {
            self.db
                .store(ResumptionLogEntry::new(
                    job_id,
                    ResumptionEvent::ResumptionSuccess,
                    true,
                    Some(format!("resumed after row {}", job.last_processed_row)),
                    None,
                ))
                .await?;
            events::emit(&EngineEvent::ResumptionSuccess {
                job_id: &job_key,
                resumed_from_row: job.last_processed_row,
            });
        }

        // Strictly 1-based data rows: the checkpoint is the last finished
        // row, so reading continues at the row after it.
        let mut row_reader = RowReader::open(&path, job.last_processed_row as u64 + 1)?;
        let mut chunk_engine = ChunkEngine {
            db: self.db.as_ref(),
            validator: &self.validator,
            dedup: &mut dedup,
            file_index: &file_index,
            locks: &self.locks,
            progress: &self.progress,
            tuning: self.config.chunk,
            update_existing: self.config.update_existing_on_duplicate,
        };
        chunk_engine.run(job_id, &mut row_reader, lock).await?;

        self.db.mark_job_completed(job_id).await?;
        let done = self.db.fetch_by(job_id).await?;
        self.progress.refresh(&done);
        events::emit(&EngineEvent::JobCompleted {
            job_id: &job_key,
            processed_rows: done.processed_rows,
            successful_rows: done.successful_rows,
            error_rows: done.error_rows,
            duration_secs: duration_secs(&done),
        });

        Ok(StartOutcome::Completed)
    }

    /// Gate for resumption: the file on disk must still be the file the
    /// witness was taken of. Failures refuse the resume and leave the job
    /// in its prior state, and the audit log carries the why.
    async fn verify_for_resumption(
        &self,
        job_id: &JobId,
        job: &mut ImportJobEntry,
        path: &Utf8Path,
    ) -> Result<(), EngineError> {
        let job_key = job.id.clone();

        if !path.exists() {
            return self
                .refuse_resumption(job_id, &job_key, "input file is missing".to_string())
                .await;
        }

        let actual = match capture_witness(path) {
            Ok(witness) => witness,
            Err(err) => {
                return self
                    .refuse_resumption(job_id, &job_key, format!("input file unreadable: {}", err))
                    .await;
            }
        };

        if job.has_witness() {
            let recorded_size = job.file_size.unwrap_or_default() as u64;
            let recorded_hash = job.file_hash.clone().unwrap_or_default();
            match verify_witness(
                recorded_size,
                &recorded_hash,
                job.file_last_modified.as_deref(),
                &actual,
            ) {
                crate::integrity::IntegrityVerdict::Match { mtime_changed } => {
                    let details = if mtime_changed {
                        "witness verified; mtime drifted but content is unchanged"
                    } else {
                        "witness verified"
                    };
                    if mtime_changed {
                        log::warn!("job {}: mtime drifted without content change", job_id);
                    }
                    self.db
                        .store(ResumptionLogEntry::new(
                            job_id,
                            ResumptionEvent::IntegrityCheck,
                            true,
                            Some(details.to_string()),
                            None,
                        ))
                        .await?;
                    events::emit(&EngineEvent::IntegrityCheck {
                        job_id: &job_key,
                        passed: true,
                        details,
                    });
                    Ok(())
                }
                crate::integrity::IntegrityVerdict::Mismatch { detail } => {
                    self.refuse_resumption(job_id, &job_key, detail).await
                }
            }
        } else {
            // Legacy job: no witness on record. Compute and trust, loudly.
            self.db
                .set_file_witness(job_id, actual.size as i64, &actual.hash, &actual.modified)
                .await?;
            job.file_size = Some(actual.size as i64);
            job.file_hash = Some(actual.hash.clone());
            job.file_last_modified = Some(actual.modified.clone());

            let mut metadata = ResumptionMetadata::parse(job.resumption_metadata.as_deref());
            metadata.integrity_note = Some("legacy calculated".to_string());
            self.db
                .set_resumption_metadata(job_id, Some(&metadata.to_json()))
                .await?;
            job.resumption_metadata = Some(metadata.to_json());

            self.db
                .store(ResumptionLogEntry::new(
                    job_id,
                    ResumptionEvent::IntegrityCheck,
                    true,
                    Some("legacy calculated: witness captured at resumption".to_string()),
                    None,
                ))
                .await?;
            events::emit(&EngineEvent::IntegrityCheck {
                job_id: &job_key,
                passed: true,
                details: "legacy calculated",
            });
            Ok(())
        }
    }

    async fn refuse_resumption(
        &self,
        job_id: &JobId,
        job_key: &str,
        detail: String,
    ) -> Result<(), EngineError> {
        self.db
            .store_all(vec![
                ResumptionLogEntry::new(
                    job_id,
                    ResumptionEvent::IntegrityCheck,
                    false,
                    Some(detail.clone()),
                    None,
                ),
                ResumptionLogEntry::new(
                    job_id,
                    ResumptionEvent::ResumptionFailure,
                    false,
                    Some(detail.clone()),
                    None,
                ),
            ])
            .await?;
        events::emit(&EngineEvent::IntegrityCheck {
            job_id: job_key,
            passed: false,
            details: &detail,
        });
        events::emit(&EngineEvent::ResumptionFailure {
            job_id: job_key,
            reason: &detail,
        });
        Err(EngineError::IntegrityRefused(detail))
    }

    /// Cached progress snapshot for the status endpoints.
    pub async fn progress(&self, job_id: &JobId) -> Result<ProgressSnapshot, EngineError> {
        Ok(self.progress.get(&self.db, job_id).await?)
    }

    /// Filtered, paged row errors.
    pub async fn errors(
        &self,
        job_id: &JobId,
        query: &ErrorQuery,
    ) -> Result<ErrorPage, EngineError> {
        // Surface NotFound for unknown jobs instead of an empty page.
        let _ = self.db.fetch_by(job_id).await?;
        Ok(self.db.fetch_errors(job_id, query).await?)
    }

    /// Job-level summary: counters, rates, failure reason, error breakdown.
    pub async fn summary(&self, job_id: &JobId) -> Result<ImportSummary, EngineError> {
        let job = self.db.fetch_by(job_id).await?;
        let progress = self.progress.refresh(&job);
        let error_counts = self.db.error_counts_by_type(job_id).await?;
        Ok(ImportSummary {
            progress,
            filename: job.filename.clone(),
            file_path: job.file_path.clone(),
            file_size: job.file_size,
            failure_reason: job.failure_reason.clone(),
            error_counts,
            duration_secs: duration_secs(&job),
        })
    }

    /// Rewinds counters to the snapshot taken at the last resumption and
    /// re-queues the job as pending. Employees already upserted stay; the
    /// rerun converges on the same rows.
    pub async fn restore_from_backup(&self, job_id: &JobId) -> Result<(), EngineError> {
        let job = self.db.fetch_by(job_id).await?;
        let metadata = ResumptionMetadata::parse(job.resumption_metadata.as_deref());
        let backup = metadata.backup.ok_or(EngineError::NoBackup(*job_id))?;

        self.db
            .restore_job_counters(
                job_id,
                backup.processed_rows,
                backup.successful_rows,
                backup.error_rows,
                backup.last_processed_row,
            )
            .await?;
        self.progress.invalidate(job_id);

        self.db
            .store(ResumptionLogEntry::new(
                job_id,
                ResumptionEvent::ResumptionAttempt,
                true,
                Some(format!(
                    "counters restored to backup taken {}",
                    backup.created_at
                )),
                None,
            ))
            .await?;
        Ok(())
    }

    /// Ledger consistency diagnostic: ledger row count vs the processed
    /// counter, plus duplicate-key detection among admitted rows.
    pub async fn validate_ledger(&self, job_id: &JobId) -> Result<LedgerReport, EngineError> {
        let job = self.db.fetch_by(job_id).await?;
        let report = self.db.validate_ledger(job_id, job.processed_rows).await?;
        if !report.is_consistent() {
            log::warn!(
                "job {}: dedup ledger inconsistent ({} ledger rows, {} processed)",
                job_id,
                report.ledger_rows,
                report.processed_rows
            );
        }
        Ok(report)
    }
}

/// Full read of the input: headers, data-row count, keep-last index. Rows
/// stream through one at a time; only the index (bounded by distinct keys)
/// is retained.
fn survey(path: &Utf8Path) -> Result<(Vec<String>, u64, FileKeyIndex), EngineError> {
    let mut row_reader = RowReader::open(path, 1)?;
    let headers = row_reader.headers().to_vec();
    let mut index = FileKeyIndex::default();
    let mut count = 0u64;
    while let Some(record) = row_reader.next_record()? {
        index.observe(&record);
        count += 1;
    }
    Ok((headers, count, index))
}

fn duration_secs(job: &ImportJobEntry) -> Option<i64> {
    let started = job
        .started_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?;
    let completed = job
        .completed_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?;
    Some(completed.signed_duration_since(started).num_seconds())
}
