use anyhow::{Context, Result};
use buildgate::changes::{ChangeHub, ChangeStore, NewChange};
use buildgate::config::{AppConfig, CliConfig, FileConfig};
use buildgate::scheduler_store::SqliteSchedulerStore;
use buildgate::server::metrics;
use buildgate::timed_scheduler::{Clock, SchedulerManager, SystemClock};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

/// Holds builds triggered by source changes until the configured time window.
///
/// Changes are read from stdin as JSON, one object per line.
#[derive(Parser, Debug)]
#[clap(version)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite scheduler database file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// The port for the metrics and status server.
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,

    /// Number of changes to keep. Set to 0 to disable pruning.
    #[clap(long, default_value_t = 0)]
    pub change_horizon: usize,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            metrics_port: self.metrics_port,
            change_horizon: self.change_horizon,
        }
    }
}

async fn read_changes(hub: Arc<ChangeHub>, shutdown: CancellationToken) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line.context("Failed to read changes from stdin")?,
        };
        let Some(line) = line else {
            info!("Change input closed, timers keep running until shutdown");
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let change: NewChange = match serde_json::from_str(line) {
            Ok(change) => change,
            Err(e) => {
                warn!("Ignoring malformed change: {}", e);
                continue;
            }
        };
        match hub.add_change(&change).await {
            Ok(change) => debug!("Change {} dispatched", change.id),
            Err(e) => error!("Failed to add change: {:#}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Opening scheduler database at {:?}", config.db_path);
    let store = Arc::new(SqliteSchedulerStore::new(&config.db_path)?);

    metrics::init_metrics();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hub = Arc::new(ChangeHub::new(
        store.clone() as Arc<dyn ChangeStore>,
        config.change_horizon,
    ));
    let manager = Arc::new(SchedulerManager::new(
        store.clone(),
        clock,
        config.schedulers,
    )?);
    manager.start(&hub).await;

    let shutdown = CancellationToken::new();

    #[cfg(not(feature = "no_metrics_server"))]
    let server_handle = {
        let state = buildgate::ServerState::new(manager.clone());
        let port = config.metrics_port;
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = buildgate::run_server(state, port, token).await {
                error!("Status server failed: {:#}", e);
            }
        })
    };

    let reader = tokio::spawn(read_changes(hub.clone(), shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    shutdown.cancel();

    match reader.await {
        Ok(Err(e)) => error!("Change reader failed: {:#}", e),
        Err(e) => error!("Change reader panicked: {}", e),
        Ok(Ok(())) => {}
    }
    manager.stop(&hub).await;

    #[cfg(not(feature = "no_metrics_server"))]
    if let Err(e) = server_handle.await {
        error!("Status server task panicked: {}", e);
    }

    Ok(())
}
