use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

pub mod aggregate;
pub mod collect;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod distributed;
pub mod error;
pub mod evaluator;
pub mod helpers;
pub mod hierarchy;
pub mod instance;
pub mod metric;
pub mod model;
pub mod padding;
pub mod reduce;
pub mod results;
pub mod shard;
pub mod stats;
pub mod task;
pub mod task_output;
#[cfg(test)]
mod testing;

// Public re-exports for external consumers
pub use config::{EvaluationMode, EvaluationOptions, FinalizationMode};
pub use distributed::{LocalProcessGroup, ProcessGroup, SingleProcess, Tensor};
pub use error::{Error, ErrorDetails};
pub use evaluator::{COORDINATOR_RANK, evaluate, simple_evaluate};
pub use hierarchy::{AggregateMetricConfig, GroupConfig, TaskEntry};
pub use instance::{Argument, Instance, OutputType, Request, RequestType};
pub use metric::{Aggregation, MetricValue};
pub use model::Model;
pub use results::{EvaluationResults, TableKind, make_table, write_results};
pub use task::{Document, Documents, Feature, Task, TaskConfig};

#[derive(clap::ValueEnum, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Jsonl,
    #[default]
    Pretty,
}

/// Command-line knobs of an evaluation run. Values given here override the config file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to a TOML file with `EvaluationOptions`.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Documents per task; values below 1.0 are a fraction of each task's documents.
    #[arg(long)]
    pub limit: Option<f64>,

    /// Bootstrap resamples for standard errors. 0 disables standard errors.
    #[arg(long)]
    pub bootstrap_iters: Option<usize>,

    #[arg(long)]
    pub log_samples: Option<bool>,

    /// Record model outputs without computing metrics.
    #[arg(long)]
    pub predict_only: bool,

    #[arg(long)]
    pub num_fewshot: Option<usize>,

    /// Generation overrides, e.g. `temperature=0,max_new_tokens=32`.
    #[arg(long)]
    pub gen_kwargs: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub fewshot_seed: Option<u64>,

    /// Opaque model arguments, recorded in the run configuration.
    #[arg(long)]
    pub model_args: Option<String>,

    /// Revision of the evaluation code, recorded in the results.
    #[arg(long)]
    pub git_hash: Option<String>,

    /// Directory for results, samples and completion markers.
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    #[arg(long)]
    pub finalization: Option<FinalizationMode>,

    #[arg(short, long)]
    pub format: Option<OutputFormat>,
}

/// Runs an evaluation configured from `args` and writes the report to `writer` on the
/// coordinator: markdown tables for `Pretty`, a single JSON line for `Jsonl`.
///
/// This does not install a subscriber. Binaries call [`helpers::setup_logging`] with the
/// same format first.
#[instrument(skip_all, fields(model = model.name()))]
pub async fn run_evaluation(
    args: &Args,
    model: &dyn Model,
    tasks: Vec<TaskEntry>,
    mut writer: impl Write,
) -> Result<()> {
    let options = EvaluationOptions::from_args(args)?;
    info!(rank = model.rank(), "Starting evaluation");
    let Some(results) = simple_evaluate(model, tasks, &options).await? else {
        return Ok(());
    };
    match options.format {
        OutputFormat::Jsonl => {
            let summary = EvaluationResults {
                samples: None,
                ..results
            };
            writeln!(writer, "{}", serde_json::to_string(&summary)?)?;
        }
        OutputFormat::Pretty => {
            writeln!(writer, "{}", make_table(&results, TableKind::Results))?;
            if results.groups.is_some() {
                writeln!(writer, "{}", make_table(&results, TableKind::Groups))?;
            }
        }
    }
    Ok(())
}
