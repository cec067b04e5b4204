use anyhow::{Context, Result};
use buildgate::log_analysis::{
    analyze, BuildLogAnalyzer, QemuLogAnalyzer, StepReport, StepResult,
};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogKind {
    /// `Building arch:config ... passed` lines.
    Build,
    /// QEMU boot tests with optional kunit results.
    Qemu,
}

/// Summarize a build or QEMU boot log into a step result and status text.
#[derive(Parser, Debug)]
#[clap(version)]
struct CliArgs {
    #[clap(long, value_enum, default_value = "build")]
    pub kind: LogKind,

    /// Name printed at the start of the summary.
    #[clap(long, default_value = "build")]
    pub step_name: String,

    /// Print the detailed text instead of the summary.
    #[clap(long)]
    pub detailed: bool,

    /// Print the whole report as JSON.
    #[clap(long)]
    pub json: bool,

    /// Log file to read. Reads stdin when omitted.
    pub log: Option<PathBuf>,
}

fn run_analysis(cli_args: &CliArgs) -> Result<StepReport> {
    let reader: Box<dyn io::BufRead> = match &cli_args.log {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    match cli_args.kind {
        LogKind::Build => analyze(
            &cli_args.step_name,
            reader,
            &mut BuildLogAnalyzer::default(),
        ),
        LogKind::Qemu => analyze(
            &cli_args.step_name,
            reader,
            &mut QemuLogAnalyzer::default(),
        ),
    }
}

fn main() -> Result<ExitCode> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let report = run_analysis(&cli_args)?;
    debug!("{} finished with {}", report.step, report.result);

    if cli_args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.result);
        if cli_args.detailed {
            println!("{}", report.detailed);
        } else {
            println!("{}", report.summary);
        }
    }

    if report.result == StepResult::Failure {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
