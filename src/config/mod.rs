mod file_config;

pub use file_config::FileConfig;

use crate::timed_scheduler::TimedSchedulerSettings;
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub change_horizon: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub metrics_port: u16,
    /// Number of recorded changes to keep; 0 keeps all of them.
    pub change_horizon: usize,
    pub schedulers: Vec<TimedSchedulerSettings>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let change_horizon = file.change_horizon.unwrap_or(cli.change_horizon);

        let mut names = HashSet::new();
        let mut schedulers = Vec::with_capacity(file.schedulers.len());
        for definition in &file.schedulers {
            let settings = TimedSchedulerSettings::from_definition(definition)?;
            if !names.insert(settings.name.clone()) {
                bail!("Duplicate scheduler name: {}", settings.name);
            }
            schedulers.push(settings);
        }

        Ok(Self {
            db_path,
            metrics_port,
            change_horizon,
            schedulers,
        })
    }
}
