use crate::{DataStore, Persist, Result};
use async_trait::async_trait;
use common::{JobId, RecordStatus, RowNumber};

pub(crate) const UPSERT_LEDGER: &str = r#"
    INSERT INTO import_processed_records (
        import_job_id, employee_number, email, row_number, status
    )
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT(import_job_id, row_number) DO UPDATE SET
        employee_number = excluded.employee_number,
        email = excluded.email,
        status = excluded.status
"#;

/// One row of the per-job dedup ledger. The conflict target is
/// `(import_job_id, row_number)`: replaying a chunk after a crash rewrites
/// the same rows instead of appending a second copy.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ProcessedRecordEntry {
    pub import_job_id: String,
    pub employee_number: Option<String>,
    pub email: Option<String>,
    pub row_number: i64,
    pub status: String,
}

impl ProcessedRecordEntry {
    pub fn new(
        job_id: &JobId,
        employee_number: Option<&str>,
        email: Option<&str>,
        row_number: RowNumber,
        status: RecordStatus,
    ) -> Self {
        Self {
            import_job_id: job_id.to_string(),
            employee_number: employee_number.map(str::to_string),
            email: email.map(str::to_string),
            row_number: row_number as i64,
            status: status.as_str().to_string(),
        }
    }
}

#[async_trait]
impl Persist<ProcessedRecordEntry> for DataStore {
    async fn store_all(&self, items: Vec<ProcessedRecordEntry>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;

        for entry in items {
            bind_ledger(sqlx::query(UPSERT_LEDGER), &entry)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn store(&self, item: ProcessedRecordEntry) -> Result<()> {
        bind_ledger(sqlx::query(UPSERT_LEDGER), &item)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

pub(crate) fn bind_ledger<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    entry: &'q ProcessedRecordEntry,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(entry.import_job_id.as_str())
        .bind(entry.employee_number.as_deref())
        .bind(entry.email.as_deref())
        .bind(entry.row_number)
        .bind(entry.status.as_str())
}

/// The identity keys a resumed job needs to rebuild its in-memory dedup
/// sets without rereading the input.
#[derive(Clone, Debug, Default)]
pub struct TrackingState {
    pub employee_numbers: Vec<String>,
    pub emails: Vec<String>,
}

/// Outcome of the ledger consistency diagnostic.
#[derive(Clone, Debug)]
pub struct LedgerReport {
    pub ledger_rows: i64,
    pub processed_rows: i64,
    pub duplicate_employee_numbers: Vec<String>,
    pub duplicate_emails: Vec<String>,
}

impl LedgerReport {
    pub fn is_consistent(&self) -> bool {
        self.ledger_rows == self.processed_rows
            && self.duplicate_employee_numbers.is_empty()
            && self.duplicate_emails.is_empty()
    }
}

impl DataStore {
    /// Keys of successfully processed rows, for rebuilding dedup sets on
    /// resumption. Skipped and errored rows never enter the sets; only a
    /// row that reached the employee table blocks its keys.
    pub async fn fetch_tracking_state(&self, job_id: &JobId) -> Result<TrackingState> {
        let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT employee_number, email
            FROM import_processed_records
            WHERE import_job_id = $1 AND status = 'processed'
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut state = TrackingState::default();
        for (number, email) in rows {
            if let Some(number) = number {
                state.employee_numbers.push(number);
            }
            if let Some(email) = email {
                state.emails.push(email);
            }
        }
        Ok(state)
    }

    pub async fn count_ledger_rows(&self, job_id: &JobId) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM import_processed_records WHERE import_job_id = $1")
                .bind(job_id.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(row.0)
    }

    /// Recomputes the ledger invariants: row count equals the job's
    /// processed counter, and no identity key was admitted twice. The
    /// duplicate check is scoped to `processed` rows; keep-last losers
    /// legitimately repeat a winner's keys with status `skipped`.
    pub async fn validate_ledger(&self, job_id: &JobId, processed_rows: i64) -> Result<LedgerReport> {
        let ledger_rows = self.count_ledger_rows(job_id).await?;

        let duplicate_employee_numbers: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT employee_number
            FROM import_processed_records
            WHERE import_job_id = $1 AND status = 'processed' AND employee_number IS NOT NULL
            GROUP BY employee_number
            HAVING COUNT(*) > 1
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;

        let duplicate_emails: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT email
            FROM import_processed_records
            WHERE import_job_id = $1 AND status = 'processed' AND email IS NOT NULL
            GROUP BY email
            HAVING COUNT(*) > 1
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;

        Ok(LedgerReport {
            ledger_rows,
            processed_rows,
            duplicate_employee_numbers: duplicate_employee_numbers
                .into_iter()
                .map(|(n,)| n)
                .collect(),
            duplicate_emails: duplicate_emails.into_iter().map(|(e,)| e).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImportJobEntry, setup};

    #[tokio::test]
    async fn test_replayed_rows_upsert_not_append() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "l.csv", "imports/l.csv"))
            .await
            .unwrap();

        store
            .store(ProcessedRecordEntry::new(
                &job,
                Some("EMP-001"),
                Some("a@example.com"),
                1,
                RecordStatus::Processed,
            ))
            .await
            .unwrap();

        // Same row replayed after a simulated crash
        store
            .store(ProcessedRecordEntry::new(
                &job,
                Some("EMP-001"),
                Some("a@example.com"),
                1,
                RecordStatus::Processed,
            ))
            .await
            .unwrap();

        assert_eq!(store.count_ledger_rows(&job).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tracking_state_only_sees_processed_rows() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "l.csv", "imports/l.csv"))
            .await
            .unwrap();

        store
            .store_all(vec![
                ProcessedRecordEntry::new(
                    &job,
                    Some("EMP-001"),
                    Some("a@example.com"),
                    1,
                    RecordStatus::Skipped,
                ),
                ProcessedRecordEntry::new(
                    &job,
                    Some("EMP-001"),
                    Some("a@example.com"),
                    2,
                    RecordStatus::Processed,
                ),
                ProcessedRecordEntry::new(&job, None, None, 3, RecordStatus::Error),
            ])
            .await
            .unwrap();

        let state = store.fetch_tracking_state(&job).await.unwrap();
        assert_eq!(state.employee_numbers, vec!["EMP-001".to_string()]);
        assert_eq!(state.emails, vec!["a@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_ledger_validation_flags_drift() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "l.csv", "imports/l.csv"))
            .await
            .unwrap();

        store
            .store_all(vec![
                ProcessedRecordEntry::new(
                    &job,
                    Some("EMP-001"),
                    Some("a@example.com"),
                    1,
                    RecordStatus::Processed,
                ),
                ProcessedRecordEntry::new(
                    &job,
                    Some("EMP-002"),
                    Some("b@example.com"),
                    2,
                    RecordStatus::Processed,
                ),
            ])
            .await
            .unwrap();

        let clean = store.validate_ledger(&job, 2).await.unwrap();
        assert!(clean.is_consistent());

        let drifted = store.validate_ledger(&job, 3).await.unwrap();
        assert!(!drifted.is_consistent());
        assert_eq!(drifted.ledger_rows, 2);
        assert_eq!(drifted.processed_rows, 3);
    }
}
