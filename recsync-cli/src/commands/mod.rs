//! Subcommand implementations and the shared session they run in.

pub mod audit;
pub mod daemon;
pub mod jobs;
pub mod mappings;
pub mod records;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use recsync_core::{config, Config, JobConfig, JobId};
use recsync_store::SqliteStore;
use recsync_sync::{pipeline, Pipeline};

/// Where this invocation finds its home directory and config file.
pub struct Session {
    pub home: PathBuf,
    config_path: Option<PathBuf>,
}

impl Session {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self { home, config_path })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| config::config_path_at(&self.home))
    }

    pub fn load_config(&self) -> Result<Config> {
        let path = self.config_path();
        config::load_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))
    }

    /// Store and remote client with every configured job registered.
    pub fn pipeline(&self, config: Config) -> Result<Pipeline<SqliteStore>> {
        pipeline::connect(config).context("failed to open the sync database")
    }
}

/// Look up a configured job or fail with the list of known ids.
pub fn job<'a>(config: &'a Config, id: &str) -> Result<&'a JobConfig> {
    config.job(&JobId::from(id)).with_context(|| {
        let known: Vec<&str> = config.jobs.iter().map(|j| j.id.as_str()).collect();
        format!(
            "job '{id}' is not configured (known jobs: {})",
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        )
    })
}
