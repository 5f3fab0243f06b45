#![allow(dead_code)]

use camino::Utf8PathBuf;
use common::{ImportConfig, JobId};
use engine::{ImportService, LockRegistry, MemoryLockRegistry};
use std::sync::Arc;
use store::DataStore;

/// Everything an end-to-end engine test needs: an in-memory store, a shared
/// lock registry, a service instance, and a temp storage root laid out the
/// way production storage is (`<root>/app/private/imports/`).
pub struct Harness {
    pub db: Arc<DataStore>,
    pub registry: Arc<MemoryLockRegistry>,
    pub service: ImportService,
    pub config: ImportConfig,
    _dir: tempfile::TempDir,
}

pub async fn setup() -> Harness {
    setup_with(|_| {}).await
}

/// Like [`setup`] but lets a test bend the config (chunk size, policy
/// flags) before the service is built.
pub async fn setup_with(tweak: impl FnOnce(&mut ImportConfig)) -> Harness {
    use sqlx::any::{AnyPoolOptions, install_default_drivers};
    // Use PoolOptions to ensure the connection stays alive
    install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1) // Force a single connection for stability in memory
        .idle_timeout(None) // Never let the connection drop due to inactivity
        .connect("sqlite::memory:")
        .await
        .expect("Could not create pool");
    let db = Arc::new(
        DataStore::new(pool)
            .await
            .expect("Failed to create test store"),
    );

    let dir = tempfile::tempdir().expect("temp storage root");
    let storage_root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::create_dir_all(storage_root.join("app/private/imports")).unwrap();

    let mut config = ImportConfig {
        storage_root,
        ..Default::default()
    };
    tweak(&mut config);

    let registry = Arc::new(MemoryLockRegistry::new());
    let dyn_registry: Arc<dyn LockRegistry> = registry.clone();
    let service = ImportService::new(db.clone(), dyn_registry, config.clone());

    Harness {
        db,
        registry,
        service,
        config,
        _dir: dir,
    }
}

impl Harness {
    /// A second service sharing this harness's store and lock registry,
    /// standing in for another worker process.
    pub fn second_worker(&self) -> ImportService {
        let dyn_registry: Arc<dyn LockRegistry> = self.registry.clone();
        ImportService::new(self.db.clone(), dyn_registry, self.config.clone())
    }

    /// Writes a file into private storage and registers it as a pending
    /// job. Returns the job id.
    pub async fn make_job(&self, filename: &str, content: &str) -> JobId {
        self.write_file(filename, content);
        let file_path = format!("imports/{}", filename);
        self.service
            .create_job(filename, &file_path)
            .await
            .expect("create job")
    }

    pub fn write_file(&self, filename: &str, content: &str) {
        std::fs::write(self.absolute_path(filename), content).expect("write input file");
    }

    pub fn absolute_path(&self, filename: &str) -> Utf8PathBuf {
        self.config
            .storage_root
            .join("app/private/imports")
            .join(filename)
    }
}

/// Standard header line every fixture uses.
pub const HEADERS: &str =
    "employee_number,first_name,last_name,email,department,salary,currency,country_code,start_date";

/// Generates a well-formed CSV with `rows` sequential employees.
pub fn sequential_csv(rows: usize) -> String {
    let mut out = String::from(HEADERS);
    out.push('\n');
    for i in 1..=rows {
        out.push_str(&format!(
            "EMP-{i:03},First{i},Last{i},emp{i}@example.com,Engineering,{},KES,KE,2022-01-01\n",
            50_000 + i
        ));
    }
    out
}
