mod chunk_txn;
mod employee_store;
mod error_store;
mod job_store;
mod ledger_store;
mod resumption_store;

pub use chunk_txn::*;
pub use employee_store::*;
pub use error_store::*;
pub use job_store::*;
pub use ledger_store::*;
pub use resumption_store::*;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::{AnyPool, any::install_default_drivers, migrate::MigrateError};
use thiserror::Error;

/// A Result type specialized for DataStore operations.
pub type Result<T> = std::result::Result<T, DataStoreError>;

/// `DataStore` is the single hub for database interactions.
///
/// ### Architectural Intent:
/// It wraps the `sqlx::Pool` and manages connection lifecycle. Row types are
/// handled through the generic `Persist`/`Fetch` traits plus a handful of
/// targeted methods (counter bumps, status transitions) that cannot be
/// expressed as whole-row writes.
///
/// ### Reasoning:
/// A single pool behind an immutable reference (`&self`) keeps connection
/// management centralized and lets every engine component share one handle.
/// Everything an import job mutates while it holds the processing lock goes
/// through [`ChunkTxn`] so a crash can never half-apply a chunk.
pub struct DataStore {
    pool: AnyPool,
}

impl DataStore {
    /// Initializes a new DataStore and runs migrations.
    /// Ensures the schema is ready before any operations begin.
    pub async fn new(pool: AnyPool) -> Result<Self> {
        let migrator = sqlx::migrate!("db/migrations");
        migrator.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Convenience constructor from a database URL.
    pub async fn connect(url: &str) -> Result<Self> {
        install_default_drivers();
        let pool = AnyPool::connect(url).await?;
        Self::new(pool).await
    }

    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Opens the transaction that spans one chunk of rows. Everything the
    /// chunk writes (employees, errors, ledger rows, job counters) commits
    /// or rolls back together; the commit is the checkpoint.
    pub async fn begin_chunk(&self) -> Result<ChunkTxn> {
        Ok(ChunkTxn::new(self.pool.begin().await?))
    }
}

/// `Persist<Data>` handles the "Storage" part of the database.
///
/// ### Intent:
/// To provide an atomic, write-only interface for storing rows.
///
/// ### Reasoning:
/// Writes require strict coordination. Grouping items in `store_all` puts a
/// whole batch in one transaction, which is what the resumption guarantees
/// lean on: either a batch of ledger rows lands or none of it does.
#[async_trait]
pub trait Persist<Data: Send + Sync> {
    /// Batch insert: processes a collection of rows in a single transaction.
    async fn store_all(&self, items: Vec<Data>) -> Result<()>;

    /// Atomic single insert: persists a single record to the database.
    async fn store(&self, item: Data) -> Result<()>;
}

/// `Fetch<ID, Data>` handles the "Query" side of the database.
///
/// ### Intent:
/// To provide a read-only interface for data retrieval.
///
/// ### Reasoning:
/// Reading is non-destructive and highly parallelizable. Status endpoints
/// read job rows through this seam without taking the processing lock.
#[async_trait]
pub trait Fetch<ID: Send + Sync, Data: Send + Sync> {
    /// Retrieves a single record by its unique identifier.
    async fn fetch_by(&self, key: &ID) -> Result<Data>;

    /// Retrieves multiple records in a single database round-trip.
    async fn fetch_many(&self, keys: &[ID]) -> Result<Vec<Data>>;
}

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Database Error: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("Migration Error: {0}")]
    MigrationError(#[from] MigrateError),
    #[error("Requested record was not found in the store")]
    NotFound,
    #[error("Unique constraint violated for {0}")]
    UniqueViolation(String),
    #[error("Stored value could not be interpreted: {0}")]
    Malformed(String),
}

/// Maps a unique-constraint failure onto its own variant so callers can
/// treat a concurrent double-insert as a duplicate rather than a crash.
pub(crate) fn map_insert_error(err: sqlx::Error, what: &str) -> DataStoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DataStoreError::UniqueViolation(what.to_string())
        }
        _ => DataStoreError::DbError(err),
    }
}

/// RFC 3339 UTC timestamp, the TEXT representation every table uses.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
async fn setup() -> DataStore {
    use sqlx::any::{AnyPoolOptions, install_default_drivers};
    // Use PoolOptions to ensure the connection stays alive
    install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1) // Force a single connection for stability in memory
        .idle_timeout(None) // Never let the connection drop due to inactivity
        .connect("sqlite::memory:")
        .await
        .expect("Could not create pool");
    // Using an in-memory database ensures tests are fast and side-effect free
    DataStore::new(pool)
        .await
        .expect("Failed to create test store")
}
