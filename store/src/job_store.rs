use crate::{DataStore, DataStoreError, Fetch, Persist, Result, now_rfc3339};
use async_trait::async_trait;
use common::{JobId, JobStatus};

const UPSERT_QUERY: &str = r#"
    INSERT INTO import_jobs (
        id, filename, file_path, status, total_rows, processed_rows,
        successful_rows, error_rows, last_processed_row, file_size,
        file_hash, file_last_modified, started_at, completed_at,
        failure_reason, resumption_metadata
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ON CONFLICT(id) DO UPDATE SET
        filename = excluded.filename,
        file_path = excluded.file_path,
        status = excluded.status,
        total_rows = excluded.total_rows,
        processed_rows = excluded.processed_rows,
        successful_rows = excluded.successful_rows,
        error_rows = excluded.error_rows,
        last_processed_row = excluded.last_processed_row,
        file_size = excluded.file_size,
        file_hash = excluded.file_hash,
        file_last_modified = excluded.file_last_modified,
        started_at = excluded.started_at,
        completed_at = excluded.completed_at,
        failure_reason = excluded.failure_reason,
        resumption_metadata = excluded.resumption_metadata
"#;

/// One import job as stored. Columns stay in their database shape (status
/// as TEXT, timestamps as RFC 3339 TEXT); the typed accessors below parse
/// on demand so a corrupted row surfaces as `Malformed` instead of a panic.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ImportJobEntry {
    pub id: String,
    pub filename: String,
    pub file_path: String,
    pub status: String,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub error_rows: i64,
    pub last_processed_row: i64,
    pub file_size: Option<i64>,
    pub file_hash: Option<String>,
    pub file_last_modified: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub failure_reason: Option<String>,
    pub resumption_metadata: Option<String>,
}

impl ImportJobEntry {
    /// Fresh pending job for an uploaded file.
    pub fn new_pending(id: &JobId, filename: &str, file_path: &str) -> Self {
        Self {
            id: id.to_string(),
            filename: filename.to_string(),
            file_path: file_path.to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            total_rows: 0,
            processed_rows: 0,
            successful_rows: 0,
            error_rows: 0,
            last_processed_row: 0,
            file_size: None,
            file_hash: None,
            file_last_modified: None,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            resumption_metadata: None,
        }
    }

    pub fn job_status(&self) -> Result<JobStatus> {
        self.status
            .parse()
            .map_err(|_| DataStoreError::Malformed(format!("job status '{}'", self.status)))
    }

    /// Whether a checkpoint exists that a new run would continue from.
    pub fn is_resumable(&self) -> bool {
        self.last_processed_row > 0
            && self.status != JobStatus::Completed.as_str()
            && (self.total_rows == 0 || self.last_processed_row < self.total_rows)
    }

    pub fn has_witness(&self) -> bool {
        self.file_size.is_some() && self.file_hash.is_some()
    }
}

#[async_trait]
impl Persist<ImportJobEntry> for DataStore {
    async fn store_all(&self, items: Vec<ImportJobEntry>) -> Result<()> {
        let mut transaction = self.pool().begin().await?;

        for entry in items {
            bind_job(sqlx::query(UPSERT_QUERY), &entry)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn store(&self, item: ImportJobEntry) -> Result<()> {
        bind_job(sqlx::query(UPSERT_QUERY), &item)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Fetch<JobId, ImportJobEntry> for DataStore {
    async fn fetch_by(&self, key: &JobId) -> Result<ImportJobEntry> {
        let mut results = self.fetch_many(std::slice::from_ref(key)).await?;
        results.pop().ok_or(DataStoreError::NotFound)
    }

    async fn fetch_many(&self, keys: &[JobId]) -> Result<Vec<ImportJobEntry>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = (1..=keys.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(",");

        let sql = format!("SELECT * FROM import_jobs WHERE id IN ({})", placeholders);

        let mut query = sqlx::query_as::<_, ImportJobEntry>(&sql);
        for id in keys {
            query = query.bind(id.to_string());
        }

        Ok(query.fetch_all(self.pool()).await?)
    }
}

fn bind_job<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    entry: &'q ImportJobEntry,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(entry.id.as_str())
        .bind(entry.filename.as_str())
        .bind(entry.file_path.as_str())
        .bind(entry.status.as_str())
        .bind(entry.total_rows)
        .bind(entry.processed_rows)
        .bind(entry.successful_rows)
        .bind(entry.error_rows)
        .bind(entry.last_processed_row)
        .bind(entry.file_size)
        .bind(entry.file_hash.as_deref())
        .bind(entry.file_last_modified.as_deref())
        .bind(entry.started_at.as_deref())
        .bind(entry.completed_at.as_deref())
        .bind(entry.failure_reason.as_deref())
        .bind(entry.resumption_metadata.as_deref())
}

impl DataStore {
    /// `pending → processing`. Stamps `started_at` only on the first run so
    /// elapsed-time math survives resumption.
    pub async fn mark_job_processing(&self, id: &JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'processing',
                started_at = COALESCE(started_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal success. Clears the resumption metadata: a completed job has
    /// nothing left to rewind to.
    pub async fn mark_job_completed(&self, id: &JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'completed',
                completed_at = $2,
                failure_reason = NULL,
                resumption_metadata = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal failure with the engine-level reason. Row-scoped errors are
    /// in import_errors; this is the job-level message the summary shows.
    pub async fn mark_job_failed(&self, id: &JobId, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'failed',
                completed_at = $2,
                failure_reason = $3
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(now_rfc3339())
        .bind(reason)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persists the survey-pass row count. Written before the first record
    /// is processed so progress percentages have a denominator.
    pub async fn set_total_rows(&self, id: &JobId, total_rows: i64) -> Result<()> {
        sqlx::query("UPDATE import_jobs SET total_rows = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(total_rows)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Records the integrity witness captured at first processing.
    pub async fn set_file_witness(
        &self,
        id: &JobId,
        file_size: i64,
        file_hash: &str,
        file_last_modified: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET file_size = $2, file_hash = $3, file_last_modified = $4
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(file_size)
        .bind(file_hash)
        .bind(file_last_modified)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_resumption_metadata(
        &self,
        id: &JobId,
        metadata: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE import_jobs SET resumption_metadata = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(metadata)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Rewind used by restore-from-backup: counters back to the snapshot,
    /// status back to pending, terminal fields cleared.
    pub async fn restore_job_counters(
        &self,
        id: &JobId,
        processed_rows: i64,
        successful_rows: i64,
        error_rows: i64,
        last_processed_row: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'pending',
                processed_rows = $2,
                successful_rows = $3,
                error_rows = $4,
                last_processed_row = $5,
                completed_at = NULL,
                failure_reason = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(processed_rows)
        .bind(successful_rows)
        .bind(error_rows)
        .bind(last_processed_row)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup;
    use common::JobId;

    #[tokio::test]
    async fn test_job_lifecycle_roundtrip() {
        let store = setup().await;
        let id = JobId::new();

        let entry = ImportJobEntry::new_pending(&id, "staff.csv", "imports/staff.csv");
        store.store(entry).await.expect("Store failed");

        let fetched = store.fetch_by(&id).await.expect("Fetch failed");
        assert_eq!(fetched.job_status().unwrap(), JobStatus::Pending);
        assert_eq!(fetched.total_rows, 0);
        assert!(!fetched.is_resumable());

        store.mark_job_processing(&id).await.unwrap();
        let processing = store.fetch_by(&id).await.unwrap();
        assert_eq!(processing.job_status().unwrap(), JobStatus::Processing);
        assert!(processing.started_at.is_some());

        // A second transition must not move started_at
        let first_started = processing.started_at.clone();
        store.mark_job_processing(&id).await.unwrap();
        let again = store.fetch_by(&id).await.unwrap();
        assert_eq!(again.started_at, first_started);

        store.mark_job_completed(&id).await.unwrap();
        let done = store.fetch_by(&id).await.unwrap();
        assert_eq!(done.job_status().unwrap(), JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.resumption_metadata.is_none());
    }

    #[tokio::test]
    async fn test_failed_jobs_keep_their_reason() {
        let store = setup().await;
        let id = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&id, "b.xlsx", "imports/b.xlsx"))
            .await
            .unwrap();

        store
            .mark_job_failed(&id, "missing required headers: email")
            .await
            .unwrap();

        let failed = store.fetch_by(&id).await.unwrap();
        assert_eq!(failed.job_status().unwrap(), JobStatus::Failed);
        assert_eq!(
            failed.failure_reason.as_deref(),
            Some("missing required headers: email")
        );
    }

    #[tokio::test]
    async fn test_witness_and_restore() {
        let store = setup().await;
        let id = JobId::new();
        let mut entry = ImportJobEntry::new_pending(&id, "c.csv", "imports/c.csv");
        entry.total_rows = 50;
        entry.processed_rows = 20;
        entry.successful_rows = 18;
        entry.error_rows = 2;
        entry.last_processed_row = 20;
        store.store(entry).await.unwrap();

        store
            .set_file_witness(&id, 1234, &"ab".repeat(32), "2026-01-01T00:00:00Z")
            .await
            .unwrap();
        let with_witness = store.fetch_by(&id).await.unwrap();
        assert!(with_witness.has_witness());
        assert!(with_witness.is_resumable());

        store.restore_job_counters(&id, 0, 0, 0, 0).await.unwrap();
        let restored = store.fetch_by(&id).await.unwrap();
        assert_eq!(restored.job_status().unwrap(), JobStatus::Pending);
        assert_eq!(restored.processed_rows, 0);
        assert_eq!(restored.last_processed_row, 0);
        // The witness survives a rewind; only counters move.
        assert!(restored.has_witness());
    }
}
