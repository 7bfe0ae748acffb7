//! Regroups a task's answered instances by document and computes per-document metrics.

use std::collections::BTreeMap;

use indicatif::ProgressBar;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::error::{Error, ErrorDetails};
use crate::helpers::{hash_string, hash_value};
use crate::instance::Instance;
use crate::metric::{MetricKey, MetricValue};
use crate::shard::shard_indices;
use crate::task::Document;
use crate::task_output::{DocMetric, TaskOutput};

/// Groups instances by `doc_id`, each group ordered by `idx`.
pub fn group_by_doc_id(instances: Vec<Instance>) -> BTreeMap<usize, Vec<Instance>> {
    let mut by_doc_id: BTreeMap<usize, Vec<Instance>> = BTreeMap::new();
    for instance in instances {
        by_doc_id
            .entry(instance.doc_id())
            .or_default()
            .push(instance);
    }
    for instances in by_doc_id.values_mut() {
        instances.sort_by_key(Instance::idx);
    }
    by_doc_id
}

/// Visits this rank's shard of the task's documents, computes metrics for every filter and
/// appends them to `task_output.sample_metrics`. Consumes the task's instances.
#[instrument(skip_all, fields(task_name = %task_output.task_name, rank = rank, world_size = world_size))]
pub fn collect_task_results(
    task_output: &mut TaskOutput,
    rank: usize,
    world_size: usize,
    log_samples: bool,
    show_progress: bool,
) -> Result<(), Error> {
    let instances = std::mem::take(&mut task_output.instances);
    let Some(filter_keys) = instances
        .first()
        .map(|instance| instance.filtered_responses.keys().cloned().collect::<Vec<_>>())
    else {
        debug!("No instances on this rank; nothing to collect");
        return Ok(());
    };
    let by_doc_id = group_by_doc_id(instances);

    let task_name = task_output.task_name.clone();
    let Some(docs) = task_output.task.eval_docs() else {
        return Err(Error::new(ErrorDetails::MissingEvalSplit { task_name }));
    };
    let image_columns: Vec<String> = if task_output.task.config().process_results_use_image {
        Vec::new()
    } else {
        docs.image_columns().into_iter().map(str::to_string).collect()
    };
    let doc_ids: Vec<usize> =
        shard_indices(docs.len(), task_output.limit, rank, world_size).collect();

    let progress_bar = if show_progress {
        ProgressBar::new((doc_ids.len() * filter_keys.len()) as u64)
    } else {
        ProgressBar::hidden()
    };
    let mut sample_metrics: Vec<(MetricKey, DocMetric)> = Vec::new();
    let mut logged_samples = Vec::new();

    for filter_key in &filter_keys {
        for &doc_id in &doc_ids {
            let Some(doc) = docs.get(doc_id) else {
                break;
            };
            let requests = by_doc_id.get(&doc_id).ok_or_else(|| {
                Error::new(ErrorDetails::ProcessResults {
                    task_name: task_name.clone(),
                    doc_id,
                    message: "no requests were built for this document".to_string(),
                })
            })?;
            let filtered = requests
                .iter()
                .map(|instance| {
                    instance.filtered_responses.get(filter_key).cloned().ok_or_else(|| {
                        Error::new(ErrorDetails::MissingFilteredResponse {
                            task_name: task_name.clone(),
                            doc_id,
                            idx: instance.idx(),
                            filter: filter_key.clone(),
                        })
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;

            let mut metric_doc = doc.clone();
            for column in &image_columns {
                metric_doc.remove(column);
            }
            let metrics = task_output
                .process_results(&metric_doc, &filtered)
                .map_err(|e| {
                    Error::new(ErrorDetails::ProcessResults {
                        task_name: task_name.clone(),
                        doc_id,
                        message: e.to_string(),
                    })
                })?;

            if log_samples {
                let target = task_output.task.doc_to_target(&metric_doc);
                let example = build_sample_record(
                    doc_id,
                    doc,
                    &metric_doc,
                    target,
                    requests,
                    filter_key,
                    &filtered,
                    &metrics,
                )?;
                logged_samples.push(example);
            }
            for (metric, value) in metrics {
                sample_metrics.push((
                    MetricKey::new(metric, filter_key.clone()),
                    DocMetric { doc_id, value },
                ));
            }
            progress_bar.inc(1);
        }
    }
    progress_bar.finish_and_clear();

    task_output.logged_samples.extend(logged_samples);
    for (key, doc_metric) in sample_metrics {
        task_output
            .sample_metrics
            .entry(key)
            .or_default()
            .push(doc_metric);
    }
    debug!(
        documents = doc_ids.len(),
        filters = filter_keys.len(),
        logged_samples = task_output.logged_samples.len(),
        "Collected task results"
    );
    Ok(())
}

#[expect(clippy::too_many_arguments)]
fn build_sample_record(
    doc_id: usize,
    doc: &Document,
    metric_doc: &Document,
    target: Value,
    requests: &[Instance],
    filter_key: &str,
    filtered: &[Value],
    metrics: &indexmap::IndexMap<String, MetricValue>,
) -> Result<Value, Error> {
    let stripped_doc: Map<String, Value> = metric_doc
        .iter()
        .filter(|(key, _)| !key.contains("image"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let prompt_hash = requests
        .first()
        .and_then(|instance| instance.request.arguments.first())
        .and_then(|argument| argument.as_json())
        .map_or_else(|| hash_string(""), hash_value);

    let mut example = Map::new();
    example.insert("doc_id".to_string(), Value::from(doc_id));
    example.insert("doc".to_string(), Value::Object(stripped_doc));
    example.insert("target_hash".to_string(), Value::String(hash_value(&target)));
    example.insert("target".to_string(), target);
    example.insert(
        "arguments".to_string(),
        Value::Array(
            requests
                .iter()
                .flat_map(|instance| instance.request.json_arguments())
                .collect(),
        ),
    );
    example.insert(
        "resps".to_string(),
        requests
            .iter()
            .map(|instance| Value::Array(instance.responses.clone()))
            .collect(),
    );
    example.insert("filtered_resps".to_string(), Value::Array(filtered.to_vec()));
    example.insert(
        "doc_hash".to_string(),
        Value::String(hash_string(&serde_json::to_string_pretty(doc)?)),
    );
    example.insert("prompt_hash".to_string(), Value::String(prompt_hash));
    example.insert("filter".to_string(), Value::String(filter_key.to_string()));
    example.insert(
        "metrics".to_string(),
        metrics.keys().cloned().map(Value::String).collect(),
    );
    for (metric, value) in metrics {
        example.insert(metric.clone(), serde_json::to_value(value)?);
    }
    Ok(Value::Object(example))
}
