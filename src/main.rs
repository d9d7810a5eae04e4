pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod embeddings;
pub mod error;
pub mod experiment;
pub mod feed_forward;
pub mod init;
pub mod layer_norm;
pub mod metrics;
pub mod model;
pub mod multi_head_attention;
pub mod optimizer;
pub mod plot;
pub mod projection_layer;
pub mod residual_connection;
pub mod tokenizer_helper;
pub mod train;
pub mod utils;

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::ExperimentConfig;
use experiment::{ExperimentLayout, Preparation};
use metrics::PerplexityLog;
use plot::{default_title, plot_perplexity};

/// Compares two transformer language models that differ only in how their
/// token embeddings start out.
#[derive(Parser, Debug)]
#[command(name = "embed-compare", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train and evaluate both models of an experiment
    Run {
        /// JSON experiment configuration; defaults are used for missing fields
        #[arg(long)]
        config: Option<PathBuf>,
        /// Without --config, selects the settings of experiment 0, 1 or 2
        #[arg(long)]
        experiment_id: Option<usize>,
        #[arg(long)]
        epochs: Option<usize>,
        /// Overwrite an existing experiment without asking
        #[arg(long, short)]
        yes: bool,
        /// Never use an accelerator
        #[arg(long)]
        cpu: bool,
    },
    /// Redraw a model's perplexity plot from its saved CSV
    Plot {
        #[arg(long, default_value = "experiments")]
        experiments_root: PathBuf,
        #[arg(long)]
        experiment_id: usize,
        #[arg(long)]
        model_id: usize,
        #[arg(long)]
        title: Option<String>,
    },
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn run(
    config: Option<PathBuf>,
    experiment_id: Option<usize>,
    epochs: Option<usize>,
    yes: bool,
    cpu: bool,
) -> Result<()> {
    let mut config = match config {
        Some(path) => ExperimentConfig::from_file(&path)?,
        None => ExperimentConfig::preset(experiment_id.unwrap_or(2)),
    };
    if let Some(id) = experiment_id {
        config.experiment_id = id;
    }
    if let Some(epochs) = epochs {
        config.epochs = epochs;
    }
    config.no_cuda |= cpu;
    config.validate()?;

    let layout = ExperimentLayout::new(&config.experiments_root, config.experiment_id);
    config.check_starter(layout.dir())?;
    let preparation = layout.prepare(yes, &mut io::stdin().lock(), &mut io::stdout())?;
    if let Preparation::Declined = preparation {
        init_logging(None)?;
        tracing::info!("Experiment {} already exists", config.experiment_id);
        tracing::info!("Exiting");
        return Ok(());
    }

    // The log file lives inside the experiment directory, so it can only be
    // opened once that directory has been cleared.
    init_logging(Some(&layout.log_file()))?;
    log_preparation(&layout, config.experiment_id, preparation);

    let args = serde_json::to_string_pretty(&config)?;
    tracing::info!("Experiment arguments: {args}");
    fs::write(layout.config_file(), &args)
        .with_context(|| format!("Failed to write {}", layout.config_file().display()))?;

    train::experiment(&config, &layout)
}

fn log_preparation(layout: &ExperimentLayout, experiment_id: usize, preparation: Preparation) {
    let dirs_created = match preparation {
        Preparation::Created { dirs_created } => dirs_created,
        Preparation::Cleared {
            failures,
            dirs_created,
        } => {
            tracing::info!("Experiment {experiment_id} already exists");
            tracing::info!("Overwriting");
            for (path, e) in failures {
                tracing::error!("Failed to delete {}. Reason: {e}", path.display());
            }
            tracing::info!("Directory cleared ({})", layout.dir().display());
            dirs_created
        }
        Preparation::Declined => return,
    };
    for dir in dirs_created {
        tracing::info!("'{}' dir created.", dir.display());
    }
}

fn replot(
    experiments_root: PathBuf,
    experiment_id: usize,
    model_id: usize,
    title: Option<String>,
) -> Result<()> {
    init_logging(None)?;
    let layout = ExperimentLayout::new(experiments_root, experiment_id);
    let log = PerplexityLog::load(&layout.perplexities(model_id))?;
    let title = title.unwrap_or_else(|| default_title(model_id));
    plot_perplexity(&log.train, &log.valid, &title, &layout.plot(model_id))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            experiment_id,
            epochs,
            yes,
            cpu,
        } => run(config, experiment_id, epochs, yes, cpu),
        Command::Plot {
            experiments_root,
            experiment_id,
            model_id,
            title,
        } => replot(experiments_root, experiment_id, model_id, title),
    }
}
