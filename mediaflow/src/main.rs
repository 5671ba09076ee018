//! Mediaflow CLI
//!
//! Runs the ELT pipeline or one of its built-in stages.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mediaflow::config::Config;
use mediaflow::events::{EventSink, FanoutEventSink, JsonlEventSink, LoggingEventSink};
use mediaflow::jobs;
use mediaflow::pipeline::PipelineBuilder;

#[derive(Parser)]
#[command(name = "mediaflow")]
#[command(about = "Load social-media records and image detections into a warehouse", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mediaflow.yaml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Override enrichment concurrency
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full stage chain (default if no command specified)
    Run,

    /// Upsert every record batch into the raw table
    LoadRaw,

    /// Detect and classify attachment images and write the snapshot
    Enrich,

    /// Replace the detection table with the snapshot
    LoadDetections {
        /// Snapshot to load instead of the configured one
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "mediaflow.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        None | Some(Commands::Run) => run_command(&cli.config, cli.concurrency),
        Some(Commands::LoadRaw) => load_raw_command(&cli.config),
        Some(Commands::Enrich) => enrich_command(&cli.config, cli.concurrency),
        Some(Commands::LoadDetections { snapshot }) => {
            load_detections_command(&cli.config, snapshot.as_deref())
        }
        Some(Commands::Validate) => validate_command(&cli.config),
        Some(Commands::GenerateConfig { output }) => generate_config_command(&output),
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

/// Loads the config file, or defaults plus environment overrides when the
/// file does not exist.
fn load_config(path: &Path, concurrency: Option<usize>) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path).with_context(|| format!("loading {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        let mut config = Config::default();
        config.apply_overrides_from(std::env::vars())?;
        config
    };
    if let Some(c) = concurrency {
        config.enrichment.concurrency = c;
    }
    config.validate()?;
    Ok(config)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")
}

fn print_summary<T: Serialize>(summary: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn run_command(config_path: &Path, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(config_path, concurrency)?;
    let config_path = std::path::absolute(config_path)?;
    let self_exe = std::env::current_exe().context("locating mediaflow executable")?;

    let mut sink = FanoutEventSink::new().with_sink(Arc::new(LoggingEventSink::debug()));
    if let Some(log_path) = config.event_log_path() {
        let jsonl = JsonlEventSink::open(&log_path)
            .with_context(|| format!("opening event log {}", log_path.display()))?;
        sink = sink.with_sink(Arc::new(jsonl));
    }
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    let pipeline = PipelineBuilder::standard(&config, &self_exe, &config_path)?
        .with_event_sink(sink)
        .build()?;

    let runtime = build_runtime()?;
    match runtime.block_on(pipeline.run()) {
        Ok(result) => {
            tracing::info!(
                run_id = %result.run_id,
                stages = result.materializations.len(),
                "All stages succeeded"
            );
            print_summary(&result)
        }
        Err(failure) => {
            print_summary(&failure.result)?;
            Err(failure.into())
        }
    }
}

fn load_raw_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path, None)?;
    let summary = jobs::load_raw(&config)?;
    print_summary(&summary)?;
    Ok(summary.ensure_complete()?)
}

fn enrich_command(config_path: &Path, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(config_path, concurrency)?;
    let runtime = build_runtime()?;
    let report = runtime.block_on(jobs::enrich(&config))?;
    print_summary(&report)
}

fn load_detections_command(config_path: &Path, snapshot: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, None)?;
    let summary = match snapshot {
        Some(path) => jobs::load_detections_from(&config, path)?,
        None => jobs::load_detections(&config)?,
    };
    print_summary(&summary)
}

fn validate_command(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!(
        pipeline = %config.pipeline.name,
        warehouse = %config.warehouse_path().display(),
        "Configuration is valid"
    );
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    let yaml = Config::default().to_yaml()?;
    std::fs::write(output, yaml).with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(path = %output.display(), "Generated sample configuration");
    Ok(())
}
