use crate::{DataStore, Persist, Result, now_rfc3339};
use async_trait::async_trait;
use common::{ErrorKind, JobId, RowNumber};

pub(crate) const INSERT_ERROR: &str = r#"
    INSERT INTO import_errors (
        import_job_id, row_number, error_type, error_message, row_snapshot, created_at
    )
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

/// One classified row error. Append-only; the `(job, row)` index keeps the
/// paginated error endpoints cheap even for pathological files.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ImportErrorEntry {
    pub import_job_id: String,
    pub row_number: i64,
    pub error_type: String,
    pub error_message: String,
    pub row_snapshot: Option<String>,
    pub created_at: String,
}

impl ImportErrorEntry {
    pub fn new(
        job_id: &JobId,
        row_number: RowNumber,
        kind: ErrorKind,
        message: &str,
        row_snapshot: Option<String>,
    ) -> Self {
        Self {
            import_job_id: job_id.to_string(),
            row_number: row_number as i64,
            error_type: kind.as_str().to_string(),
            error_message: message.to_string(),
            row_snapshot,
            created_at: now_rfc3339(),
        }
    }
}

#[async_trait]
impl Persist<ImportErrorEntry> for DataStore {
    async fn store_all(&self, items: Vec<ImportErrorEntry>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;

        for entry in items {
            bind_error(sqlx::query(INSERT_ERROR), &entry)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn store(&self, item: ImportErrorEntry) -> Result<()> {
        bind_error(sqlx::query(INSERT_ERROR), &item)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

pub(crate) fn bind_error<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    entry: &'q ImportErrorEntry,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(entry.import_job_id.as_str())
        .bind(entry.row_number)
        .bind(entry.error_type.as_str())
        .bind(entry.error_message.as_str())
        .bind(entry.row_snapshot.as_deref())
        .bind(entry.created_at.as_str())
}

/// Filter and paging for the error endpoints.
#[derive(Clone, Debug, Default)]
pub struct ErrorQuery {
    /// Restrict to one error type (`validation`, `duplicate`, …).
    pub error_type: Option<ErrorKind>,
    /// Maximum number of results to return. Capped at 1000.
    pub limit: Option<u32>,
    /// Number of results to skip (for pagination).
    pub offset: Option<u32>,
}

/// One page of errors plus enough metadata to page further.
#[derive(Clone, Debug)]
pub struct ErrorPage {
    pub entries: Vec<ImportErrorEntry>,
    pub total_count: i64,
    pub offset: u32,
    pub has_next_page: bool,
}

impl DataStore {
    /// Errors for a job in row order, filtered and paged.
    pub async fn fetch_errors(&self, job_id: &JobId, query: &ErrorQuery) -> Result<ErrorPage> {
        let limit = query.limit.unwrap_or(100).min(1000);
        let offset = query.offset.unwrap_or(0);

        let (filter_sql, kind) = match query.error_type {
            Some(kind) => (" AND error_type = $2", Some(kind.as_str())),
            None => ("", None),
        };

        let count_sql = format!(
            "SELECT COUNT(*) FROM import_errors WHERE import_job_id = $1{}",
            filter_sql
        );
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql).bind(job_id.to_string());
        if let Some(kind) = kind {
            count_query = count_query.bind(kind);
        }
        let (total_count,) = count_query.fetch_one(self.pool()).await?;

        let page_sql = format!(
            r#"
            SELECT import_job_id, row_number, error_type, error_message, row_snapshot, created_at
            FROM import_errors
            WHERE import_job_id = $1{}
            ORDER BY row_number ASC, id ASC
            LIMIT {} OFFSET {}
            "#,
            filter_sql, limit, offset
        );
        let mut page_query =
            sqlx::query_as::<_, ImportErrorEntry>(&page_sql).bind(job_id.to_string());
        if let Some(kind) = kind {
            page_query = page_query.bind(kind);
        }
        let entries = page_query.fetch_all(self.pool()).await?;

        let has_next_page = (offset as i64 + entries.len() as i64) < total_count;
        Ok(ErrorPage {
            entries,
            total_count,
            offset,
            has_next_page,
        })
    }

    /// Per-type counts for the summary endpoint.
    pub async fn error_counts_by_type(&self, job_id: &JobId) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT error_type, COUNT(*)
            FROM import_errors
            WHERE import_job_id = $1
            GROUP BY error_type
            ORDER BY error_type
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImportJobEntry, setup};

    async fn seed_job(store: &DataStore) -> JobId {
        let id = JobId::new();
        store
            .store(ImportJobEntry::new_pending(&id, "e.csv", "imports/e.csv"))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_error_pagination_and_filter() {
        let store = setup().await;
        let job = seed_job(&store).await;

        let mut batch = Vec::new();
        for row in 1..=5u64 {
            batch.push(ImportErrorEntry::new(
                &job,
                row,
                ErrorKind::Validation,
                "email must be a valid email address",
                None,
            ));
        }
        batch.push(ImportErrorEntry::new(
            &job,
            6,
            ErrorKind::Duplicate,
            "duplicate employee_number within file",
            Some(r#"{"employee_number":"EMP-001"}"#.into()),
        ));
        store.store_all(batch).await.unwrap();

        let page = store
            .fetch_errors(
                &job,
                &ErrorQuery {
                    limit: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total_count, 6);
        assert_eq!(page.entries.len(), 4);
        assert!(page.has_next_page);
        assert_eq!(page.entries[0].row_number, 1);

        let dupes = store
            .fetch_errors(
                &job,
                &ErrorQuery {
                    error_type: Some(ErrorKind::Duplicate),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(dupes.total_count, 1);
        assert_eq!(dupes.entries[0].row_number, 6);
        assert!(!dupes.has_next_page);

        let counts = store.error_counts_by_type(&job).await.unwrap();
        assert_eq!(
            counts,
            vec![("duplicate".to_string(), 1), ("validation".to_string(), 5)]
        );
    }
}
