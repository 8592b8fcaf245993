//! Tripload - trip-record ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tripload_common::logging::{init_logging, LogConfig, LogLevel};
use tripload_ingest::config::PipelineConfig;
use tripload_ingest::destination::PgDestination;
use tripload_ingest::driver::PipelineDriver;
use tripload_ingest::loader::LoadMode;
use tripload_ingest::report::{self, OutputFormat};
use tripload_ingest::staging;

#[derive(Parser, Debug)]
#[command(name = "tripload")]
#[command(author, version, about = "Idempotent trip-record ingestion")]
struct Cli {
    /// Pipeline configuration file (TOML); built-in groups when omitted
    #[arg(short, long, global = true, env = "TRIPLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch, reconcile and load the selected groups
    Run {
        /// Group to process; repeat for several, omit for all
        #[arg(short, long = "group")]
        groups: Vec<String>,

        /// Report format: table or json
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,

        /// Artifacts fetched and reconciled at once
        #[arg(long)]
        concurrency: Option<usize>,

        #[arg(long, value_enum)]
        load_mode: Option<LoadModeArg>,

        /// Identity granted read access on the destination dataset
        #[arg(long)]
        grant_reader: Option<String>,

        /// Hide download progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// List the artifacts each group would process, without any I/O
    Plan {
        #[arg(short, long = "group")]
        groups: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LoadModeArg {
    Incremental,
    Batch,
}

impl From<LoadModeArg> for LoadMode {
    fn from(arg: LoadModeArg) -> Self {
        match arg {
            LoadModeArg::Incremental => LoadMode::Incremental,
            LoadModeArg::Batch => LoadMode::Batch,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tripload")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Plan { groups } => {
            let selected = config.resolve_groups(&groups)?;
            let plan: Vec<_> = selected
                .iter()
                .map(|g| (g.name.as_str(), g.table.as_str(), g.artifacts()))
                .collect();
            println!("{}", report::render_plan(&plan));
            Ok(ExitCode::SUCCESS)
        },
        Command::Run {
            groups,
            format,
            concurrency,
            load_mode,
            grant_reader,
            no_progress,
        } => {
            if let Some(concurrency) = concurrency {
                config.pipeline.fetch_concurrency = concurrency;
            }
            if let Some(mode) = load_mode {
                config.pipeline.load_mode = mode.into();
            }
            if grant_reader.is_some() {
                config.pipeline.reader_identity = grant_reader;
            }
            if no_progress || format == OutputFormat::Json {
                config.pipeline.show_progress = false;
            }
            config.validate()?;
            config.resolve_groups(&groups)?;

            let store = staging::connect(&config.staging).await?;
            let destination = Arc::new(
                PgDestination::connect(&config.destination)
                    .await
                    .context("Failed to connect to the destination database")?,
            );

            let driver = PipelineDriver::new(config, store, destination)?;
            let batch = driver.run(&groups).await?;

            println!("{}", report::render(&batch, format)?);

            if batch.has_failures() {
                info!("Finished with {} failed artifacts", batch.failed());
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}
