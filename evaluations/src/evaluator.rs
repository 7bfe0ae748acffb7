use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::OutputFormat;
use crate::aggregate::aggregate;
use crate::collect::collect_task_results;
use crate::completion::{CompletionMarkers, finalize};
use crate::config::{EvaluationMode, EvaluationOptions, FinalizationMode};
use crate::dispatch::dispatch_requests;
use crate::error::{Error, ErrorDetails};
use crate::hierarchy::{LeafTask, TaskEntry, TaskHierarchy};
use crate::instance::RequestType;
use crate::model::Model;
use crate::padding::PaddingLedger;
use crate::reduce::reduce_task_output;
use crate::results::{EvaluationResults, RunConfig, write_results};
use crate::shard::resolve_limit;
use crate::task_output::TaskOutput;

/// The rank that aggregates and reports results.
pub const COORDINATOR_RANK: usize = 0;

/// Runs every leaf task of `tasks` against `model`.
///
/// Every rank of the model's process group must call this with the same tasks and options.
/// The coordinator returns the result document; the other ranks return `None`.
pub async fn evaluate(
    model: &dyn Model,
    tasks: Vec<TaskEntry>,
    options: &EvaluationOptions,
) -> Result<Option<EvaluationResults>, Error> {
    let (hierarchy, leaves) = flatten_tasks(tasks)?;
    run(model, &hierarchy, leaves, options).await
}

fn flatten_tasks(tasks: Vec<TaskEntry>) -> Result<(TaskHierarchy, Vec<LeafTask>), Error> {
    if tasks.is_empty() {
        return Err(Error::new(ErrorDetails::EmptyTaskList));
    }
    let (hierarchy, leaves) = TaskHierarchy::flatten(tasks)?;
    if leaves.is_empty() {
        return Err(Error::new(ErrorDetails::EmptyTaskList));
    }
    Ok((hierarchy, leaves))
}

#[instrument(skip_all, fields(rank = model.rank(), world_size = model.world_size(), tasks = leaves.len()))]
async fn run(
    model: &dyn Model,
    hierarchy: &TaskHierarchy,
    leaves: Vec<LeafTask>,
    options: &EvaluationOptions,
) -> Result<Option<EvaluationResults>, Error> {
    options.validate()?;
    let group = model.process_group();
    let rank = group.rank();
    let world_size = group.world_size();

    for leaf in &leaves {
        let task_name = leaf.task.name().to_string();
        if options.mode == EvaluationMode::PredictOnly && !options.log_samples {
            return Err(Error::new(ErrorDetails::BypassRequiresLogSamples { task_name }));
        }
        let request_type = leaf.task.config().output_type.request_type();
        if !model.supports(request_type) {
            return Err(Error::new(ErrorDetails::UnsupportedRequestType {
                task_name,
                request_type,
            }));
        }
    }

    if options.finalization == FinalizationMode::MarkerFiles
        && let Some(output_path) = &options.output_path
    {
        CompletionMarkers::new(output_path, rank, world_size)
            .clear_stale()
            .await?;
        if world_size > 1 {
            group.barrier().await?;
        }
    }

    let mut ledger = PaddingLedger::default();
    let mut task_outputs = Vec::with_capacity(leaves.len());
    for LeafTask { task, group_name } in leaves {
        let mut task_output = TaskOutput::new(task, group_name, options.mode);
        let task_name = task_output.task_name.clone();
        let Some(doc_count) = task_output.task.eval_docs().map(|docs| docs.len()) else {
            return Err(Error::new(ErrorDetails::MissingEvalSplit { task_name }));
        };
        let limit = resolve_limit(options.limit, doc_count);
        task_output.limit = limit;

        task_output.instances = task_output
            .task
            .build_all_requests(limit, rank, world_size)
            .map_err(|e| {
                Error::new(ErrorDetails::BuildRequests {
                    task_name: task_name.clone(),
                    message: e.to_string(),
                })
            })?;
        debug!(
            task_name,
            instances = task_output.instances.len(),
            ?limit,
            "Built requests"
        );
        if world_size > 1 {
            let request_type: RequestType = task_output.task.config().output_type.request_type();
            ledger
                .record_task(group, &task_name, request_type, &task_output.instances)
                .await?;
        }
        task_outputs.push(task_output);
    }

    dispatch_requests(model, &mut task_outputs, &ledger).await?;

    let show_progress = rank == COORDINATOR_RANK && options.format == OutputFormat::Pretty;
    for task_output in &mut task_outputs {
        task_output
            .task
            .apply_filters(&mut task_output.instances)
            .map_err(|e| {
                Error::new(ErrorDetails::ApplyFilters {
                    task_name: task_output.task_name.clone(),
                    message: e.to_string(),
                })
            })?;
        collect_task_results(
            task_output,
            rank,
            world_size,
            options.log_samples,
            show_progress,
        )?;
    }

    if world_size > 1 {
        for task_output in &mut task_outputs {
            reduce_task_output(group, task_output, options.log_samples, COORDINATOR_RANK).await?;
        }
    }

    let results = if rank == COORDINATOR_RANK {
        let results = aggregate(
            &mut task_outputs,
            hierarchy,
            options.bootstrap_iters,
            options.log_samples,
        )?;
        info!(tasks = results.results.len(), "Aggregated results");
        Some(results)
    } else {
        None
    };

    finalize(options.finalization, group, options.output_path.as_deref()).await?;
    Ok(results)
}

/// Applies run-wide overrides to every leaf task, runs [`evaluate`] and stamps the run
/// configuration on the coordinator's result. With an output path the coordinator also
/// writes the results to disk.
#[instrument(skip_all, fields(model = model.name()))]
pub async fn simple_evaluate(
    model: &dyn Model,
    tasks: Vec<TaskEntry>,
    options: &EvaluationOptions,
) -> Result<Option<EvaluationResults>, Error> {
    let mut options = options.clone();
    if options.mode == EvaluationMode::PredictOnly && !options.log_samples {
        info!("Predict-only mode records model outputs; enabling sample logging");
        options.log_samples = true;
    }
    options.validate()?;
    info!(
        random_seed = ?options.random_seed,
        fewshot_random_seed = ?options.fewshot_random_seed,
        "Setting seeds"
    );

    let (hierarchy, mut leaves) = flatten_tasks(tasks)?;
    let gen_kwargs = options.parsed_gen_kwargs()?;
    for leaf in &mut leaves {
        let task = &mut leaf.task;
        let task_name = task.name().to_string();
        let config_error = |e: anyhow::Error| {
            Error::new(ErrorDetails::Config {
                message: format!("task `{task_name}`: {e}"),
            })
        };

        if let Some(gen_kwargs) = &gen_kwargs
            && task.config().output_type.request_type() == RequestType::GenerateUntil
        {
            task.set_config(
                "generation_kwargs",
                Value::Object(gen_kwargs.clone()),
                true,
            )
            .map_err(config_error)?;
        }

        match (task.config().num_fewshot, options.num_fewshot) {
            (Some(0), Some(requested)) if requested != 0 => {
                info!(
                    task_name,
                    requested, "Task pins num_fewshot to 0; ignoring the override"
                );
            }
            (Some(current), Some(requested)) if current != requested => {
                warn!(
                    task_name,
                    current, requested, "Overwriting the task's default num_fewshot"
                );
                task.set_config("num_fewshot", Value::from(requested), false)
                    .map_err(config_error)?;
            }
            (None, requested) => {
                task.set_config("num_fewshot", Value::from(requested.unwrap_or(0)), false)
                    .map_err(config_error)?;
            }
            _ => {}
        }
        task.set_fewshot_seed(options.fewshot_random_seed);
    }

    let results = run(model, &hierarchy, leaves, &options).await?;
    let Some(mut results) = results else {
        return Ok(None);
    };
    results.config = Some(RunConfig {
        run_id: Uuid::now_v7(),
        model: model.name().to_string(),
        model_args: options.model_args.clone(),
        device: model.device().to_string(),
        world_size: model.world_size(),
        limit: options.limit,
        bootstrap_iters: options.bootstrap_iters,
        gen_kwargs: options.gen_kwargs.clone(),
        random_seed: options.random_seed,
        fewshot_random_seed: options.fewshot_random_seed,
    });
    results.date = Some(chrono::Utc::now().to_rfc3339());
    results.git_hash = options.git_hash.clone();

    if let Some(output_path) = &options.output_path {
        write_results(&results, output_path).await?;
    }
    Ok(Some(results))
}
