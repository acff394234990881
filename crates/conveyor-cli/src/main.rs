//! Conveyor - streaming ETL over keyword files

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conveyor_cli::runner::{report, run_pipeline};
use conveyor_cli::settings::{ClusterRule, RunConfig};
use conveyor_common::logging::{init_logging, LogConfig, LogLevel};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about = "Streaming ETL pipelines over keyword files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline
    Run {
        /// Settings file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Input files; the n-th file is source n
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Output files; with several, source n is written to output n
        #[arg(short, long, required = true, num_args = 1..)]
        output: Vec<PathBuf>,

        /// Start a new cluster at records carrying this field
        #[arg(long)]
        cluster_field: Option<String>,

        /// Only start a cluster when the field has this value
        #[arg(long, requires = "cluster_field")]
        cluster_value: Option<String>,

        /// Number of transform workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Validate settings and print the effective configuration
    Check {
        /// Settings file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("conveyor".to_string())
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            config,
            input,
            output,
            cluster_field,
            cluster_value,
            workers,
        } => {
            let mut settings = RunConfig::load(config.as_deref())?;
            if let Some(field) = cluster_field {
                settings.cluster = Some(ClusterRule {
                    field,
                    value: cluster_value,
                });
            }
            if let Some(workers) = workers {
                settings.pipeline.concurrency_level = workers;
            }
            settings.validate()?;

            let result = run_pipeline(&settings, input, output, None).await?;
            report(&result);
            if !result.status.is_success() {
                anyhow::bail!("pipeline ended with status {}", result.status);
            }
            info!("Pipeline complete");
        },
        Command::Check { config } => {
            let settings = RunConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        },
    }

    Ok(())
}
