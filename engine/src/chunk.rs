use crate::EngineError;
use crate::dedup::{DedupDecision, Deduplicator, FileKeyIndex};
use crate::events::{self, EngineEvent};
use crate::lock::{JobLock, LockManager};
use crate::progress::ProgressTracker;
use crate::validator::RecordValidator;
use common::{ChunkTuning, ErrorKind, JobId, RecordStatus};
use reader::{RowReader, RowRecord};
use std::time::Instant;
use store::{
    ChunkTxn, DataStore, DataStoreError, EmployeeEntry, Fetch, ImportErrorEntry,
    ProcessedRecordEntry,
};

/// Resident set size of this process, if the platform exposes it.
fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

enum RowOutcome {
    Admitted,
    ValidationFailed,
    Duplicate,
    SystemFailed,
}

/// The chunk loop: read, validate, dedup-decide, upsert, count. One
/// transaction per chunk, the commit is the checkpoint, the chunk size
/// follows observed memory pressure, and lock renewal is checked at
/// every boundary.
pub(crate) struct ChunkEngine<'a> {
    pub db: &'a DataStore,
    pub validator: &'a RecordValidator,
    pub dedup: &'a mut Deduplicator,
    pub file_index: &'a FileKeyIndex,
    pub locks: &'a LockManager,
    pub progress: &'a ProgressTracker,
    pub tuning: ChunkTuning,
    pub update_existing: bool,
}

impl ChunkEngine<'_> {
    pub(crate) async fn run(
        &mut self,
        job_id: &JobId,
        row_reader: &mut RowReader,
        lock: &mut JobLock,
    ) -> Result<(), EngineError> {
        let mut chunk_size = self
            .tuning
            .initial_size
            .clamp(self.tuning.min_size, self.tuning.max_size);

        loop {
            let records = row_reader.next_chunk(chunk_size)?;
            let Some(first) = records.first() else {
                break;
            };
            let first_row = first.row_number;
            let last_row = records.last().map(|r| r.row_number).unwrap_or(first_row);
            let started = Instant::now();

            let mut txn = self.db.begin_chunk().await?;
            let mut validation_errors = 0u64;
            let mut duplicates = 0u64;

            for record in &records {
                match self.process_row(&mut txn, job_id, record).await? {
                    RowOutcome::Admitted | RowOutcome::SystemFailed => {}
                    RowOutcome::ValidationFailed => validation_errors += 1,
                    RowOutcome::Duplicate => duplicates += 1,
                }
            }

            // The checkpoint: counters, ledger, errors and employees land
            // together. A crash before this line replays the chunk; a crash
            // after it resumes at last_row + 1.
            txn.commit().await?;

            let entry = self.db.fetch_by(job_id).await?;
            self.progress.refresh(&entry);

            let job_key = entry.id.as_str();
            events::emit(&EngineEvent::ChunkProcessed {
                job_id: job_key,
                first_row,
                last_row,
                rows: records.len(),
                duration_ms: started.elapsed().as_millis(),
                chunk_size,
            });
            if validation_errors > 0 {
                events::emit(&EngineEvent::ValidationErrors {
                    job_id: job_key,
                    first_row,
                    last_row,
                    count: validation_errors,
                });
            }
            if duplicates > 0 {
                events::emit(&EngineEvent::DuplicateDetection {
                    job_id: job_key,
                    first_row,
                    last_row,
                    count: duplicates,
                });
            }

            // Cooperative cancellation: the lock expiring unrenewed is the
            // stop signal, honored only between chunks.
            if self.locks.needs_renewal(lock) {
                let renewed = self.locks.renew(self.db, &entry, lock).await?;
                events::emit(&EngineEvent::LockRenewal {
                    job_id: job_key,
                    renewed,
                    timeout_secs: lock.timeout.as_secs(),
                });
                if !renewed {
                    return Err(EngineError::LockLost(*job_id));
                }
            }

            chunk_size = self.adjust_chunk_size(job_key, chunk_size);
        }

        Ok(())
    }

    /// One row, start to finish. Store-level failures on the row are
    /// recorded as `system` errors and processing continues; only failures
    /// while recording the failure itself abort the chunk.
    async fn process_row(
        &mut self,
        txn: &mut ChunkTxn,
        job_id: &JobId,
        record: &RowRecord,
    ) -> Result<RowOutcome, EngineError> {
        let violations = self.validator.validate(record);
        if !violations.is_empty() {
            let snapshot = row_snapshot(record);
            for violation in &violations {
                txn.append_error(&ImportErrorEntry::new(
                    job_id,
                    record.row_number,
                    violation.kind,
                    violation.message,
                    Some(snapshot.clone()),
                ))
                .await?;
            }
            txn.upsert_ledger(&ledger_row(job_id, record, RecordStatus::Error))
                .await?;
            txn.mark_row_processed(job_id, false, record.row_number).await?;
            return Ok(RowOutcome::ValidationFailed);
        }

        // Presence passed, so both identity keys exist.
        let number = record.get_trimmed("employee_number").unwrap_or_default();
        let email = record.get_trimmed("email").unwrap_or_default();

        if self.file_index.is_superseded(number, email, record.row_number) {
            self.skip_duplicate(
                txn,
                job_id,
                record,
                "duplicate within file: a later row carries the same employee_number or email",
            )
            .await?;
            return Ok(RowOutcome::Duplicate);
        }

        match self.admit_row(txn, job_id, record, number, email).await {
            Ok(outcome) => Ok(outcome),
            Err(DataStoreError::UniqueViolation(_)) => {
                // Another job inserted the same person between our lookup
                // and our insert. The constraint is the safety net; the row
                // degrades to an ordinary duplicate.
                self.skip_duplicate(
                    txn,
                    job_id,
                    record,
                    "employee already exists: inserted concurrently by another import",
                )
                .await?;
                Ok(RowOutcome::Duplicate)
            }
            Err(err) => {
                let message = format!("row processing failed: {}", err);
                txn.append_error(&ImportErrorEntry::new(
                    job_id,
                    record.row_number,
                    ErrorKind::System,
                    &message,
                    Some(row_snapshot(record)),
                ))
                .await?;
                txn.upsert_ledger(&ledger_row(job_id, record, RecordStatus::Error))
                    .await?;
                txn.mark_row_processed(job_id, false, record.row_number).await?;
                Ok(RowOutcome::SystemFailed)
            }
        }
    }

    async fn admit_row(
        &mut self,
        txn: &mut ChunkTxn,
        job_id: &JobId,
        record: &RowRecord,
        number: &str,
        email: &str,
    ) -> Result<RowOutcome, DataStoreError> {
        let existing = txn.find_employee(number, email).await?;

        match self.dedup.decide(number, email, existing, self.update_existing) {
            DedupDecision::SkipSessionDuplicate => {
                self.skip_duplicate(
                    txn,
                    job_id,
                    record,
                    "duplicate within import: employee_number or email already processed",
                )
                .await?;
                Ok(RowOutcome::Duplicate)
            }
            DedupDecision::SkipStoreDuplicate => {
                self.skip_duplicate(
                    txn,
                    job_id,
                    record,
                    "employee already exists and duplicate updates are disabled",
                )
                .await?;
                Ok(RowOutcome::Duplicate)
            }
            DedupDecision::UpdateExisting(current) => {
                let incoming = employee_from_record(record, number, email);
                txn.update_employee(&incoming.merged_into(&current)).await?;
                self.admit_bookkeeping(txn, job_id, record, number, email).await?;
                Ok(RowOutcome::Admitted)
            }
            DedupDecision::InsertNew => {
                txn.insert_employee(&employee_from_record(record, number, email))
                    .await?;
                self.admit_bookkeeping(txn, job_id, record, number, email).await?;
                Ok(RowOutcome::Admitted)
            }
        }
    }

    async fn admit_bookkeeping(
        &mut self,
        txn: &mut ChunkTxn,
        job_id: &JobId,
        record: &RowRecord,
        number: &str,
        email: &str,
    ) -> Result<(), DataStoreError> {
        txn.upsert_ledger(&ProcessedRecordEntry::new(
            job_id,
            Some(number),
            Some(email),
            record.row_number,
            RecordStatus::Processed,
        ))
        .await?;
        txn.mark_row_processed(job_id, true, record.row_number).await?;
        self.dedup.mark_as_processed(number, email);
        Ok(())
    }

    async fn skip_duplicate(
        &mut self,
        txn: &mut ChunkTxn,
        job_id: &JobId,
        record: &RowRecord,
        message: &str,
    ) -> Result<(), DataStoreError> {
        txn.append_error(&ImportErrorEntry::new(
            job_id,
            record.row_number,
            ErrorKind::Duplicate,
            message,
            Some(row_snapshot(record)),
        ))
        .await?;
        txn.upsert_ledger(&ledger_row(job_id, record, RecordStatus::Skipped))
            .await?;
        txn.mark_row_processed(job_id, false, record.row_number).await?;
        Ok(())
    }

    /// Memory-pressure controller. Above the shrink threshold the chunk
    /// halves (never below the floor, so progress continues); well below it
    /// the chunk grows by half up to the cap. Platforms with no resident
    /// reading keep the current size.
    fn adjust_chunk_size(&self, job_id: &str, current: usize) -> usize {
        let Some(resident) = resident_memory_bytes() else {
            return current;
        };
        let limit = self.tuning.memory_limit_mb.saturating_mul(1024 * 1024);
        if limit == 0 {
            return current;
        }

        let ratio = resident as f64 / limit as f64;
        if ratio > self.tuning.shrink_above {
            events::emit(&EngineEvent::MemoryWarning {
                job_id,
                resident_mb: resident / (1024 * 1024),
                limit_mb: self.tuning.memory_limit_mb,
                chunk_size: current,
            });
            (current / 2).max(self.tuning.min_size)
        } else if ratio < self.tuning.grow_below && current < self.tuning.max_size {
            ((current as f64 * 1.5) as usize).min(self.tuning.max_size)
        } else {
            current
        }
    }
}

/// JSON snapshot of the row as received, trimmed, empties as nulls. Stored
/// alongside every error so support can see exactly what was rejected.
fn row_snapshot(record: &RowRecord) -> String {
    let mut map = serde_json::Map::new();
    for (key, value) in &record.fields {
        let trimmed = value.trim();
        let json_value = if trimmed.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(trimmed.to_string())
        };
        map.insert(key.clone(), json_value);
    }
    serde_json::Value::Object(map).to_string()
}

fn ledger_row(job_id: &JobId, record: &RowRecord, status: RecordStatus) -> ProcessedRecordEntry {
    ProcessedRecordEntry::new(
        job_id,
        record.get_trimmed("employee_number"),
        record.get_trimmed("email"),
        record.row_number,
        status,
    )
}

fn employee_from_record(record: &RowRecord, number: &str, email: &str) -> EmployeeEntry {
    let mut entry = EmployeeEntry::new(
        number,
        record.get_trimmed("first_name").unwrap_or_default(),
        record.get_trimmed("last_name").unwrap_or_default(),
        email,
    );
    entry.department = record.get_trimmed("department").map(str::to_string);
    entry.salary = record.get_trimmed("salary").and_then(|s| s.parse().ok());
    entry.currency = record.get_trimmed("currency").map(str::to_string);
    entry.country_code = record.get_trimmed("country_code").map(str::to_string);
    entry.start_date = record.get_trimmed("start_date").map(str::to_string);
    entry
}
