use anyhow::Result;
use buildgate::build_counter::{
    GitReferenceResolver, SqliteBuildCounter, DEFAULT_DB_PATH, DEFAULT_GIT_CACHE,
    DEFAULT_LOG_PATH,
};
use clap::{error::ErrorKind, CommandFactory, Parser};
use std::path::PathBuf;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Count running builds per repository and branch.
///
/// When the last running build of every branch completes, one line per
/// branch is appended to the log file and the counters are reset.
#[derive(Parser, Debug)]
#[clap(version)]
struct CliArgs {
    /// Delete and re-create the database.
    #[clap(short, long)]
    pub remove: bool,

    /// Count a started build. Takes REPOSITORY BRANCH.
    #[clap(short, long)]
    pub start: bool,

    /// Count a completed build. Takes REPOSITORY BRANCH. Runs after
    /// --start when both are given.
    #[clap(short, long)]
    pub complete: bool,

    /// REPOSITORY BRANCH
    pub details: Vec<String>,

    #[clap(long, default_value = DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// File receiving the completion report.
    #[clap(long, default_value = DEFAULT_LOG_PATH)]
    pub log_file: PathBuf,

    /// Directory holding the git clones used to resolve references.
    #[clap(long, default_value = DEFAULT_GIT_CACHE)]
    pub git_cache: PathBuf,
}

impl CliArgs {
    fn validate(&self) {
        if !self.remove && !self.start && !self.complete {
            CliArgs::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "one of --remove, --start or --complete is required",
                )
                .exit();
        }
        if (self.start || self.complete) && self.details.len() != 2 {
            CliArgs::command()
                .error(
                    ErrorKind::WrongNumberOfValues,
                    "--start and --complete take exactly REPOSITORY BRANCH",
                )
                .exit();
        }
    }
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    cli_args.validate();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let mut counter = SqliteBuildCounter::open(
        &cli_args.db,
        cli_args.remove,
        Box::new(GitReferenceResolver::new(cli_args.git_cache.clone())),
        cli_args.log_file.clone(),
    )?;

    run(&cli_args, &mut counter)
}

fn run(cli_args: &CliArgs, counter: &mut SqliteBuildCounter) -> Result<()> {
    let [repository, branch] = cli_args.details.as_slice() else {
        return Ok(());
    };
    if cli_args.start {
        counter.build_started(repository, branch)?;
    }
    if cli_args.complete {
        if let Some(records) = counter.build_completed(repository, branch)? {
            info!(
                "All builds completed, reported {} branches to {:?}",
                records.len(),
                cli_args.log_file
            );
        }
    }
    Ok(())
}
