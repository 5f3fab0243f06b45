use anyhow::Result;
use common::{ImportConfig, JobId};
use engine::{ImportService, MemoryLockRegistry, StartOutcome};
use env_logger::Env;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};
use store::DataStore;

#[derive(Deserialize, Serialize)]
#[serde(default)]
struct ServiceConfig {
    database_url: String,
    import: ImportConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://rosterd.db?mode=rwc".to_string(),
            import: ImportConfig::default(),
        }
    }
}

/// Worker entry point: `rosterd <job-id> [<job-id> ...]`.
///
/// The queue runtime that decides *which* jobs to run is out of scope; this
/// binary is what it executes, one process per batch of job ids.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let config_path =
        std::env::var("ROSTERD_CONFIG").unwrap_or_else(|_| "rosterd.toml".to_string());
    let app_config = {
        let path = Path::new(&config_path);
        if !path.exists() {
            // First run: write the defaults out so operators have a file to
            // edit instead of guessing key names.
            let config = ServiceConfig::default();
            fs::write(path, toml::to_string(&config)?)?;
            config
        } else {
            toml::from_str::<ServiceConfig>(&fs::read_to_string(path)?)?
        }
    };

    let job_ids = std::env::args().skip(1).collect::<Vec<_>>();
    if job_ids.is_empty() {
        log::error!("usage: rosterd <job-id> [<job-id> ...]");
        std::process::exit(2);
    }

    let db = Arc::new(DataStore::connect(&app_config.database_url).await?);
    let registry = Arc::new(MemoryLockRegistry::new());
    let service = ImportService::new(db, registry, app_config.import);

    let mut exit_code = 0;
    for raw in job_ids {
        let job_id: JobId = raw.parse()?;
        match service.start_or_resume(&job_id).await {
            Ok(StartOutcome::Completed) => log::info!("job {} completed", job_id),
            Ok(StartOutcome::AlreadyComplete) => {
                log::info!("job {} was already complete", job_id)
            }
            Ok(StartOutcome::AlreadyFailed) => {
                log::info!("job {} failed previously; restore it before retrying", job_id)
            }
            Ok(StartOutcome::LockHeld) => {
                log::info!("job {} is held by another worker", job_id)
            }
            Err(err) => {
                log::error!("job {} did not finish: {}", job_id, err);
                exit_code = 1;
            }
        }
    }

    std::process::exit(exit_code);
}
