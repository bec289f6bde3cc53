mod config;
mod observability;
mod output;
mod pipeline;

use batcher::{BatchError, BatchingForwarder, ValidationError};
use clap::{Args, Parser};
use config::{Config, ConfigError};
use observability::ObservabilityError;
use output::JsonLinesForwarder;
use pipeline::PipelineError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "stat-forwarder", about = "Batches stat payloads per routing key")]
enum CliCommand {
    /// Read payloads from stdin and write merged batches to stdout
    Run(ConfigArgs),
    /// Load and validate a config file
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Observability(#[from] ObservabilityError),
    #[error("invalid batcher config: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => run(args),
        CliCommand::CheckConfig(args) => check_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stat-forwarder: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(args: ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;
    let batcher = &config.batcher;

    println!("Config {} is valid", args.config.display());
    println!("  max accumulation delay: {:?}", batcher.max_delay());
    println!("  max batch size: {}", batcher.max_batch_size);
    println!("  queue capacity: {}", batcher.queue_capacity());
    match batcher.shutdown_timeout() {
        Some(timeout) => println!("  shutdown timeout: {timeout:?}"),
        None => println!("  shutdown timeout: none"),
    }
    match &config.common.metrics {
        Some(metrics) => println!(
            "  metrics: {}:{} ({})",
            metrics.statsd_host, metrics.statsd_port, metrics.prefix
        ),
        None => println!("  metrics: disabled"),
    }

    Ok(())
}

fn run(args: ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;

    let _guard = observability::init_logging(&config.common.logging)?;
    if let Some(metrics) = &config.common.metrics {
        observability::init_metrics(metrics)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<(), CliError> {
    let service = Arc::new(JsonLinesForwarder::new(tokio::io::stdout()));
    let forwarder = BatchingForwarder::new(config.batcher, service)?;
    tracing::info!("Reading stat payloads from stdin");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = pipeline::run_pipeline(stdin, &forwarder, shutdown).await;

    // Drain buffered batches even when reading failed
    let closed = forwarder.close().await;
    let stats = result?;
    closed?;

    tracing::info!(
        lines = stats.lines,
        accepted = stats.accepted,
        skipped = stats.skipped,
        "Input finished, all batches forwarded"
    );
    Ok(())
}
