use crate::{DataStore, DataStoreError, Fetch, Persist, Result, map_insert_error, now_rfc3339};
use async_trait::async_trait;
use uuid::Uuid;

pub(crate) const INSERT_EMPLOYEE: &str = r#"
    INSERT INTO employees (
        id, employee_number, first_name, last_name, email, department,
        salary, currency, country_code, start_date, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

pub(crate) const UPDATE_EMPLOYEE: &str = r#"
    UPDATE employees
    SET employee_number = $2,
        first_name = $3,
        last_name = $4,
        email = $5,
        department = $6,
        salary = $7,
        currency = $8,
        country_code = $9,
        start_date = $10,
        updated_at = $11
    WHERE id = $1
"#;

/// The target entity. `employee_number` and `email` carry UNIQUE
/// constraints, which double as the cross-job safety net: two workers
/// racing to insert the same person produce one row and one
/// `UniqueViolation`, never two rows.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct EmployeeEntry {
    pub id: String,
    pub employee_number: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub department: Option<String>,
    pub salary: Option<f64>,
    pub currency: Option<String>,
    pub country_code: Option<String>,
    pub start_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EmployeeEntry {
    pub fn new(employee_number: &str, first_name: &str, last_name: &str, email: &str) -> Self {
        let now = now_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            employee_number: employee_number.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            department: None,
            salary: None,
            currency: None,
            country_code: None,
            start_date: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Carries the incoming record's fields onto an existing row, keeping
    /// the row identity and creation time.
    pub fn merged_into(&self, existing: &EmployeeEntry) -> EmployeeEntry {
        EmployeeEntry {
            id: existing.id.clone(),
            created_at: existing.created_at.clone(),
            updated_at: now_rfc3339(),
            ..self.clone()
        }
    }
}

#[async_trait]
impl Persist<EmployeeEntry> for DataStore {
    async fn store_all(&self, items: Vec<EmployeeEntry>) -> Result<()> {
        let mut transaction = self.pool().begin().await?;

        for entry in items {
            bind_employee_insert(sqlx::query(INSERT_EMPLOYEE), &entry)
                .execute(&mut *transaction)
                .await
                .map_err(|e| map_insert_error(e, "employee"))?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn store(&self, item: EmployeeEntry) -> Result<()> {
        bind_employee_insert(sqlx::query(INSERT_EMPLOYEE), &item)
            .execute(self.pool())
            .await
            .map_err(|e| map_insert_error(e, "employee"))?;
        Ok(())
    }
}

#[async_trait]
impl Fetch<String, EmployeeEntry> for DataStore {
    /// Key is the employee id (UUID string).
    async fn fetch_by(&self, key: &String) -> Result<EmployeeEntry> {
        let mut results = self.fetch_many(std::slice::from_ref(key)).await?;
        results.pop().ok_or(DataStoreError::NotFound)
    }

    async fn fetch_many(&self, keys: &[String]) -> Result<Vec<EmployeeEntry>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = (1..=keys.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(",");

        let sql = format!("SELECT * FROM employees WHERE id IN ({})", placeholders);

        let mut query = sqlx::query_as::<_, EmployeeEntry>(&sql);
        for id in keys {
            query = query.bind(id.as_str());
        }

        Ok(query.fetch_all(self.pool()).await?)
    }
}

pub(crate) fn bind_employee_insert<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    entry: &'q EmployeeEntry,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(entry.id.as_str())
        .bind(entry.employee_number.as_str())
        .bind(entry.first_name.as_str())
        .bind(entry.last_name.as_str())
        .bind(entry.email.as_str())
        .bind(entry.department.as_deref())
        .bind(entry.salary)
        .bind(entry.currency.as_deref())
        .bind(entry.country_code.as_deref())
        .bind(entry.start_date.as_deref())
        .bind(entry.created_at.as_str())
        .bind(entry.updated_at.as_str())
}

pub(crate) fn bind_employee_update<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    entry: &'q EmployeeEntry,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(entry.id.as_str())
        .bind(entry.employee_number.as_str())
        .bind(entry.first_name.as_str())
        .bind(entry.last_name.as_str())
        .bind(entry.email.as_str())
        .bind(entry.department.as_deref())
        .bind(entry.salary)
        .bind(entry.currency.as_deref())
        .bind(entry.country_code.as_deref())
        .bind(entry.start_date.as_deref())
        .bind(entry.updated_at.as_str())
}

impl DataStore {
    /// Lookup outside a chunk transaction, used by tests and diagnostics.
    /// The in-chunk variant lives on [`crate::ChunkTxn`].
    pub async fn find_employee_by_number(&self, employee_number: &str) -> Result<Option<EmployeeEntry>> {
        Ok(
            sqlx::query_as::<_, EmployeeEntry>(
                "SELECT * FROM employees WHERE employee_number = $1",
            )
            .bind(employee_number)
            .fetch_optional(self.pool())
            .await?,
        )
    }

    pub async fn find_employee_by_email(&self, email: &str) -> Result<Option<EmployeeEntry>> {
        Ok(
            sqlx::query_as::<_, EmployeeEntry>("SELECT * FROM employees WHERE email = $1")
                .bind(email)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn count_employees(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM employees")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
