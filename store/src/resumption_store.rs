use crate::{DataStore, Persist, Result, now_rfc3339};
use async_trait::async_trait;
use common::{JobId, ResumptionEvent};

const INSERT_LOG: &str = r#"
    INSERT INTO resumption_logs (
        import_job_id, event_type, passed, details, metadata, created_at
    )
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

/// Append-only operational audit trail: every integrity check, lock
/// operation and resumption attempt leaves one of these behind.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ResumptionLogEntry {
    pub import_job_id: String,
    pub event_type: String,
    pub passed: i64,
    pub details: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}

impl ResumptionLogEntry {
    pub fn new(
        job_id: &JobId,
        event: ResumptionEvent,
        passed: bool,
        details: Option<String>,
        metadata: Option<String>,
    ) -> Self {
        Self {
            import_job_id: job_id.to_string(),
            event_type: event.as_str().to_string(),
            passed: passed as i64,
            details,
            metadata,
            created_at: now_rfc3339(),
        }
    }

    pub fn passed(&self) -> bool {
        self.passed != 0
    }
}

#[async_trait]
impl Persist<ResumptionLogEntry> for DataStore {
    async fn store_all(&self, items: Vec<ResumptionLogEntry>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;

        for entry in items {
            sqlx::query(INSERT_LOG)
                .bind(entry.import_job_id)
                .bind(entry.event_type)
                .bind(entry.passed)
                .bind(entry.details)
                .bind(entry.metadata)
                .bind(entry.created_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn store(&self, item: ResumptionLogEntry) -> Result<()> {
        sqlx::query(INSERT_LOG)
            .bind(item.import_job_id)
            .bind(item.event_type)
            .bind(item.passed)
            .bind(item.details)
            .bind(item.metadata)
            .bind(item.created_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

impl DataStore {
    /// Audit entries for one job, oldest first.
    pub async fn fetch_resumption_logs(&self, job_id: &JobId) -> Result<Vec<ResumptionLogEntry>> {
        Ok(sqlx::query_as::<_, ResumptionLogEntry>(
            r#"
            SELECT import_job_id, event_type, passed, details, metadata, created_at
            FROM resumption_logs
            WHERE import_job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?)
    }
}
