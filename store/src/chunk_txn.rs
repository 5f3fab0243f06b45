use crate::{
    EmployeeEntry, ImportErrorEntry, ProcessedRecordEntry, Result, employee_store, error_store,
    ledger_store, map_insert_error,
};
use common::{JobId, RowNumber};
use sqlx::{Any, Transaction};

const MARK_ROW_SUCCESS: &str = r#"
    UPDATE import_jobs
    SET processed_rows = processed_rows + 1,
        successful_rows = successful_rows + 1,
        last_processed_row = CASE
            WHEN last_processed_row < $2 THEN $2
            ELSE last_processed_row
        END
    WHERE id = $1
"#;

const MARK_ROW_ERROR: &str = r#"
    UPDATE import_jobs
    SET processed_rows = processed_rows + 1,
        error_rows = error_rows + 1,
        last_processed_row = CASE
            WHEN last_processed_row < $2 THEN $2
            ELSE last_processed_row
        END
    WHERE id = $1
"#;

/// All writes for one chunk of rows, on a single database transaction.
///
/// The commit is the checkpoint: job counters, `last_processed_row`, ledger
/// rows, error rows and employee upserts land together or not at all, which
/// is what makes a crash between chunks recoverable without double counting.
///
/// Reads that feed row decisions (the store-duplicate lookup) also go
/// through the transaction so a chunk observes its own earlier writes.
pub struct ChunkTxn {
    tx: Transaction<'static, Any>,
}

impl ChunkTxn {
    pub(crate) fn new(tx: Transaction<'static, Any>) -> Self {
        Self { tx }
    }

    /// Store-duplicate lookup: by employee number first, then by email;
    /// first hit wins.
    pub async fn find_employee(
        &mut self,
        employee_number: &str,
        email: &str,
    ) -> Result<Option<EmployeeEntry>> {
        let by_number = sqlx::query_as::<_, EmployeeEntry>(
            "SELECT * FROM employees WHERE employee_number = $1",
        )
        .bind(employee_number)
        .fetch_optional(&mut *self.tx)
        .await?;
        if by_number.is_some() {
            return Ok(by_number);
        }

        Ok(
            sqlx::query_as::<_, EmployeeEntry>("SELECT * FROM employees WHERE email = $1")
                .bind(email)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    pub async fn insert_employee(&mut self, entry: &EmployeeEntry) -> Result<()> {
        employee_store::bind_employee_insert(sqlx::query(employee_store::INSERT_EMPLOYEE), entry)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_insert_error(e, "employee"))?;
        Ok(())
    }

    pub async fn update_employee(&mut self, entry: &EmployeeEntry) -> Result<()> {
        employee_store::bind_employee_update(sqlx::query(employee_store::UPDATE_EMPLOYEE), entry)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_insert_error(e, "employee"))?;
        Ok(())
    }

    pub async fn append_error(&mut self, entry: &ImportErrorEntry) -> Result<()> {
        error_store::bind_error(sqlx::query(error_store::INSERT_ERROR), entry)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn upsert_ledger(&mut self, entry: &ProcessedRecordEntry) -> Result<()> {
        ledger_store::bind_ledger(sqlx::query(ledger_store::UPSERT_LEDGER), entry)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Atomic counter bump for one finished row. `last_processed_row` only
    /// ever moves forward.
    pub async fn mark_row_processed(
        &mut self,
        job_id: &JobId,
        success: bool,
        row_number: RowNumber,
    ) -> Result<()> {
        let sql = if success { MARK_ROW_SUCCESS } else { MARK_ROW_ERROR };
        sqlx::query(sql)
            .bind(job_id.to_string())
            .bind(row_number as i64)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Commit everything this chunk wrote. Dropping the value without
    /// calling this rolls the whole chunk back.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataStoreError, Fetch, ImportJobEntry, Persist, setup};
    use common::{ErrorKind, RecordStatus};

    #[tokio::test]
    async fn test_chunk_commits_atomically() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "t.csv", "imports/t.csv"))
            .await
            .unwrap();

        let mut txn = store.begin_chunk().await.unwrap();
        txn.insert_employee(&EmployeeEntry::new(
            "EMP-001",
            "John",
            "Doe",
            "john@example.com",
        ))
        .await
        .unwrap();
        txn.upsert_ledger(&ProcessedRecordEntry::new(
            &job,
            Some("EMP-001"),
            Some("john@example.com"),
            1,
            RecordStatus::Processed,
        ))
        .await
        .unwrap();
        txn.mark_row_processed(&job, true, 1).await.unwrap();
        txn.commit().await.unwrap();

        let entry = store.fetch_by(&job).await.unwrap();
        assert_eq!(entry.processed_rows, 1);
        assert_eq!(entry.successful_rows, 1);
        assert_eq!(entry.last_processed_row, 1);
        assert_eq!(store.count_employees().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_chunk_rolls_back() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "t.csv", "imports/t.csv"))
            .await
            .unwrap();

        {
            let mut txn = store.begin_chunk().await.unwrap();
            txn.insert_employee(&EmployeeEntry::new(
                "EMP-001",
                "John",
                "Doe",
                "john@example.com",
            ))
            .await
            .unwrap();
            txn.mark_row_processed(&job, true, 1).await.unwrap();
            // Dropped without commit: the simulated crash
        }

        let entry = store.fetch_by(&job).await.unwrap();
        assert_eq!(entry.processed_rows, 0);
        assert_eq!(entry.last_processed_row, 0);
        assert_eq!(store.count_employees().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_chunk_lookup_sees_own_writes() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "t.csv", "imports/t.csv"))
            .await
            .unwrap();

        let mut txn = store.begin_chunk().await.unwrap();
        txn.insert_employee(&EmployeeEntry::new(
            "EMP-001",
            "John",
            "Doe",
            "john@example.com",
        ))
        .await
        .unwrap();

        let found = txn
            .find_employee("EMP-001", "john@example.com")
            .await
            .unwrap();
        assert!(found.is_some());

        // Email fallback path
        let by_email = txn
            .find_employee("EMP-MISSING", "john@example.com")
            .await
            .unwrap();
        assert_eq!(by_email.unwrap().employee_number, "EMP-001");

        let err = txn
            .insert_employee(&EmployeeEntry::new(
                "EMP-001",
                "Jane",
                "Smith",
                "jane@example.com",
            ))
            .await
            .expect_err("unique violation expected");
        assert!(matches!(err, DataStoreError::UniqueViolation(_)));

        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_rows_count_against_error_counter() {
        let store = setup().await;
        let job = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&job, "t.csv", "imports/t.csv"))
            .await
            .unwrap();

        let mut txn = store.begin_chunk().await.unwrap();
        txn.append_error(&ImportErrorEntry::new(
            &job,
            1,
            ErrorKind::Validation,
            "last_name is required",
            None,
        ))
        .await
        .unwrap();
        txn.mark_row_processed(&job, false, 1).await.unwrap();
        txn.commit().await.unwrap();

        let entry = store.fetch_by(&job).await.unwrap();
        assert_eq!(entry.processed_rows, 1);
        assert_eq!(entry.successful_rows, 0);
        assert_eq!(entry.error_rows, 1);
    }
}
