//! flowchron - command line entry point
//!
//! `train-and-generate` trains a composite model on `<root>/train.csv` and
//! writes synthetic flows next to it; `generate` samples from a saved model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowchron::baseline::{DomainFlowSampler, TemplateModel, TemplateSearch, WeightedPatternSampler};
use flowchron::config::{PipelineConfig, TomlConfig};
use flowchron::dataset::FlowDataset;
use flowchron::{CompositeModel, Pipeline, TrainedModel};
use flowchron_common::config::{default_config_path, RootFolderInitializer, RootFolderResolver};
use flowchron_common::events::{EventBus, PipelineEvent};
use flowchron_common::human_time::format_compact;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MODULE_NAME: &str = "flowchron";
const TRAIN_FILE: &str = "train.csv";
const SYNTHETIC_FILE: &str = "artifact_evaluation_syn.csv";
const MODEL_FILE: &str = "models/artifact_evaluation.json";

#[derive(Parser, Debug)]
#[command(name = "flowchron")]
#[command(about = "Parallel pattern-based synthetic flow generation")]
#[command(version)]
struct Args {
    /// Config file (default: FLOWCHRON_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on <path>/train.csv, then write <path>/artifact_evaluation_syn.csv
    TrainAndGenerate {
        /// Number of training chunks (0 trains one model on the whole dataset)
        #[arg(long)]
        n_split: Option<usize>,

        /// Save the composite model under <path>/models
        #[arg(long)]
        save_model: bool,

        /// Data root
        #[arg(long, env = "FLOWCHRON_ROOT")]
        path: Option<PathBuf>,

        /// Concurrent training workers
        #[arg(long)]
        workers: Option<usize>,

        /// Concurrent sampling workers
        #[arg(long)]
        sample_cpus: Option<usize>,
    },

    /// Sample synthetic flows from a saved composite model
    Generate {
        /// Saved composite model
        #[arg(long)]
        model: PathBuf,

        /// Output CSV (default: <root>/artifact_evaluation_syn.csv)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Concurrent sampling workers
        #[arg(long)]
        cpus: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(|| default_config_path(MODULE_NAME));
    let toml_config = TomlConfig::load(config_path.as_deref());
    init_tracing(&toml_config)?;

    info!("Starting flowchron {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config: {}", path.display());
    }

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel_token.clone()));

    let event_bus = EventBus::new(256);
    tokio::spawn(report_progress(event_bus.clone()));

    let mut pipeline_config = toml_config.pipeline.clone();
    match args.command {
        Command::TrainAndGenerate {
            n_split,
            save_model,
            path,
            workers,
            sample_cpus,
        } => {
            if let Some(n) = n_split {
                pipeline_config.n_split = n;
            }
            if workers.is_some() {
                pipeline_config.train_workers = workers;
            }
            if sample_cpus.is_some() {
                pipeline_config.sample_workers = sample_cpus;
            }

            let root = init_root(path, config_path)?;
            let pipeline = Pipeline::new(pipeline_config.clone())
                .with_event_bus(event_bus)
                .with_cancel_token(cancel_token)
                .with_chunk_dir(root.chunk_dir());

            let dataset = FlowDataset::load_csv(
                &root.root_folder().join(TRAIN_FILE),
                &pipeline_config.time_column,
                pipeline_config.continuous_bins,
            )
            .context("Failed to load training data")?;

            let search = Arc::new(TemplateSearch::new(
                pipeline_config.key_columns.clone(),
                pipeline_config.min_support,
            ));
            let trained = pipeline.train(dataset, search).await?;

            if save_model {
                let model_path = root.root_folder().join(MODEL_FILE);
                trained
                    .model()
                    .save_model(&model_path)
                    .with_context(|| format!("Failed to save model to {}", model_path.display()))?;
            }

            let output = root.root_folder().join(SYNTHETIC_FILE);
            sample_and_write(&pipeline, &trained, &pipeline_config, &output).await?;
        }

        Command::Generate { model, output, cpus } => {
            if cpus.is_some() {
                pipeline_config.sample_workers = cpus;
            }

            let output = match output {
                Some(output) => output,
                None => init_root(None, config_path)?.root_folder().join(SYNTHETIC_FILE),
            };

            let composite = CompositeModel::<TemplateModel>::load_model(&model)
                .with_context(|| format!("Failed to load model from {}", model.display()))?;
            let trained = TrainedModel::from_saved(composite);

            let pipeline = Pipeline::new(pipeline_config.clone())
                .with_event_bus(event_bus)
                .with_cancel_token(cancel_token);
            sample_and_write(&pipeline, &trained, &pipeline_config, &output).await?;
        }
    }

    info!("Done");
    Ok(())
}

async fn sample_and_write(
    pipeline: &Pipeline,
    trained: &TrainedModel<TemplateModel>,
    config: &PipelineConfig,
    output: &Path,
) -> Result<()> {
    let table = pipeline
        .generate(
            trained,
            &WeightedPatternSampler::new(config.seed),
            Arc::new(DomainFlowSampler::new(config.seed)),
        )
        .await?;
    table
        .write_csv(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}

fn init_root(cli_path: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<RootFolderInitializer> {
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(cli_path)
        .with_config_path(config_path)
        .resolve();

    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize data root: {}", e))?;
    info!("Data root: {}", initializer.root_folder().display());
    Ok(initializer)
}

fn init_tracing(config: &TomlConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match &config.logging.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}

/// Cancel the run on Ctrl+C; in-flight chunks still finish
async fn cancel_on_ctrl_c(token: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            warn!("Ctrl+C received, no further chunks will be submitted");
            token.cancel();
        }
        Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
    }
}

async fn report_progress(event_bus: EventBus) {
    let mut rx = event_bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(PipelineEvent::ChunkCompleted {
                stage,
                finished,
                total,
                ..
            }) => {
                info!("{}: {}/{} chunks", stage, finished, total);
            }
            Ok(PipelineEvent::StageCompleted {
                stage,
                succeeded,
                failed,
                elapsed_ms,
                ..
            }) => {
                info!(
                    "{} finished: {} succeeded, {} failed in {}",
                    stage,
                    succeeded,
                    failed,
                    format_compact(std::time::Duration::from_millis(elapsed_ms))
                );
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Progress reporter lagged, skipped {} events", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
