use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Process-wide engine configuration. Immutable after initialization; every
/// component receives a clone (or a field copy) at construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Root of the upload storage area. Relative job paths are resolved
    /// against `<root>/app/private/` first, then `<root>/app/`.
    pub storage_root: Utf8PathBuf,
    /// Hard cap on input file size in bytes.
    pub max_file_size: u64,
    /// Hard cap on data rows per file.
    pub max_rows: u64,
    /// Whether a store-duplicate row updates the existing employee instead
    /// of being skipped with a duplicate error.
    pub update_existing_on_duplicate: bool,
    /// TTL for cached validation verdicts, in seconds. 0 disables the cache.
    pub validation_cache_ttl_secs: u64,
    /// TTL for cached progress snapshots, in seconds.
    pub progress_cache_ttl_secs: u64,
    pub chunk: ChunkTuning,
    pub lock: LockTuning,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            storage_root: Utf8PathBuf::from("storage"),
            max_file_size: 20 * 1024 * 1024,
            max_rows: 50_000,
            update_existing_on_duplicate: true,
            validation_cache_ttl_secs: 300,
            progress_cache_ttl_secs: 3600,
            chunk: ChunkTuning::default(),
            lock: LockTuning::default(),
        }
    }
}

/// Bounds for the adaptive chunk-size controller.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkTuning {
    pub initial_size: usize,
    /// Floor under memory pressure. Never goes lower, so the engine always
    /// makes forward progress.
    pub min_size: usize,
    pub max_size: usize,
    pub memory_limit_mb: u64,
    /// Resident fraction of the limit above which the chunk size halves.
    pub shrink_above: f64,
    /// Resident fraction below which the chunk size grows by half.
    pub grow_below: f64,
}

impl Default for ChunkTuning {
    fn default() -> Self {
        Self {
            initial_size: 100,
            min_size: 10,
            max_size: 500,
            memory_limit_mb: 256,
            shrink_above: 0.80,
            grow_below: 0.30,
        }
    }
}

/// Bounds and windows for the per-job processing lock.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockTuning {
    /// Clamp floor for the adaptive timeout (5 minutes).
    pub min_timeout_secs: u64,
    /// Clamp ceiling for the adaptive timeout (4 hours).
    pub max_timeout_secs: u64,
    /// The holder renews once `now >= expires_at - renewal_window`.
    pub renewal_window_secs: u64,
    /// Renewal metadata outlives the lock itself by this much.
    pub meta_grace_secs: u64,
}

impl Default for LockTuning {
    fn default() -> Self {
        Self {
            min_timeout_secs: 5 * 60,
            max_timeout_secs: 4 * 60 * 60,
            renewal_window_secs: 5 * 60,
            meta_grace_secs: 5 * 60,
        }
    }
}

impl ImportConfig {
    /// Resolves a job's `file_path` to an on-disk location. Absolute paths
    /// are accepted as-is; relative paths are probed under the storage
    /// root's `app/private/` then `app/` subtrees. The `app/private/`
    /// candidate is returned even when nothing exists, so the caller gets a
    /// plain io error from the open instead of a second path policy here.
    pub fn resolve_file_path(&self, file_path: &str) -> Utf8PathBuf {
        let path = Utf8Path::new(file_path);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        let private = self.storage_root.join("app/private").join(path);
        if private.exists() {
            return private;
        }

        let app = self.storage_root.join("app").join(path);
        if app.exists() {
            return app;
        }

        private
    }

    /// Canonical subpath for a freshly uploaded file.
    pub fn import_subpath(filename: &str) -> Utf8PathBuf {
        Utf8PathBuf::from("imports").join(filename)
    }
}
