//! Coordinator-side folding of task aggregates into group aggregates and result tables.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::Error;
use crate::hierarchy::{GroupConfig, NodeKind, TaskHierarchy};
use crate::results::{EvaluationResults, ResultTable, SampleCount};
use crate::stats::{aggregate_subtask_metrics, pooled_sample_stderr};
use crate::task_output::TaskOutput;

const NOT_AVAILABLE: &str = "N/A";
/// The row key used for groups that only act as a header.
const HEADER_ONLY_KEY: &str = " ";

/// Per-task tables gathered from the task outputs.
#[derive(Debug, Default)]
pub struct ConsolidatedResults {
    pub results: ResultTable,
    pub samples: IndexMap<String, Vec<Value>>,
    pub configs: BTreeMap<String, Value>,
    pub versions: BTreeMap<String, Value>,
    pub n_shot: BTreeMap<String, usize>,
    pub higher_is_better: BTreeMap<String, IndexMap<String, Option<bool>>>,
}

pub fn consolidate_results(task_outputs: &[TaskOutput]) -> ConsolidatedResults {
    let mut consolidated = ConsolidatedResults::default();
    for output in task_outputs {
        let name = &output.task_name;
        let mut row = IndexMap::new();
        row.insert(
            "alias".to_string(),
            Value::String(output.alias().unwrap_or(name.as_str()).to_string()),
        );
        for (key, value) in &output.agg_metrics {
            row.insert(key.clone(), value.clone());
        }
        if !output.sample_metrics.is_empty() {
            row.insert("samples".to_string(), Value::from(output.sample_len));
        }
        consolidated.results.insert(name.clone(), row);

        let mut samples = output.logged_samples.clone();
        samples.sort_by_key(|sample| sample.get("doc_id").and_then(Value::as_u64));
        consolidated.samples.insert(name.clone(), samples);
        consolidated
            .configs
            .insert(name.clone(), output.task.dump_config());
        consolidated
            .versions
            .insert(name.clone(), output.task.version());
        consolidated.n_shot.insert(name.clone(), output.n_shot());
        consolidated.higher_is_better.insert(
            name.clone(),
            output
                .higher_is_better()
                .into_iter()
                .map(|(metric, higher)| (metric, Some(higher)))
                .collect(),
        );
    }
    consolidated
}

fn group_alias(name: &str, config: Option<&GroupConfig>, task_outputs: &[TaskOutput]) -> String {
    config
        .and_then(|config| config.group_alias.clone())
        .or_else(|| {
            // A leaf directly under the group may carry the group's alias in its own config
            task_outputs
                .iter()
                .filter(|output| output.group_name.as_deref() == Some(name))
                .find_map(|output| output.task.config().group_alias.clone())
        })
        .unwrap_or_else(|| name.to_string())
}

/// Adds one row per group. Groups with an aggregate metric list fold the matching metrics of
/// all their leaf tasks; the others get a header-only row.
///
/// Returns whether any group has aggregates to show.
#[instrument(skip_all)]
pub fn consolidate_group_results(
    results: &mut ResultTable,
    versions: &mut BTreeMap<String, Value>,
    hierarchy: &TaskHierarchy,
    task_outputs: &[TaskOutput],
) -> bool {
    let mut show_group_table = false;
    for (node, config) in hierarchy.groups() {
        let mut row = IndexMap::new();
        row.insert(
            "alias".to_string(),
            Value::String(group_alias(&node.name, config, task_outputs)),
        );
        versions.insert(
            node.name.clone(),
            Value::String(NOT_AVAILABLE.to_string()),
        );

        let Some(metric_configs) = config.and_then(|config| config.aggregate_metric_list.as_ref())
        else {
            row.insert(
                HEADER_ONLY_KEY.to_string(),
                Value::String(HEADER_ONLY_KEY.to_string()),
            );
            results.insert(node.name.clone(), row);
            continue;
        };
        show_group_table |= !metric_configs.is_empty();
        if let Some(version) = config.and_then(|config| config.metadata.get("version")) {
            versions.insert(node.name.clone(), version.clone());
        }

        let leaves = hierarchy.leaf_descendants(&node.name);
        let metric_keys: BTreeSet<&String> = leaves
            .iter()
            .filter_map(|leaf| results.get(*leaf))
            .flat_map(|leaf_row| leaf_row.keys())
            .filter(|key| !key.contains("_stderr") && *key != "alias" && *key != "samples")
            .collect();

        let mut aggregated = Vec::new();
        for metric_key in metric_keys {
            let Some(metric_config) = metric_configs
                .iter()
                .find(|metric_config| metric_config.matches(metric_key))
            else {
                continue;
            };
            let (metric, filter) = metric_key
                .split_once(',')
                .unwrap_or((metric_key.as_str(), ""));
            let stderr_key = format!("{metric}_stderr,{filter}");

            let mut values = Vec::new();
            let mut sizes = Vec::new();
            let mut stderrs = Vec::new();
            let mut stderr_missing = false;
            for leaf_row in leaves.iter().filter_map(|leaf| results.get(*leaf)) {
                let Some(value) = leaf_row.get(metric_key) else {
                    continue;
                };
                let Some(value) = value.as_f64() else {
                    warn!(
                        group = %node.name,
                        metric = %metric_key,
                        "Skipping group aggregation of a non-numeric metric"
                    );
                    values.clear();
                    break;
                };
                values.push(value);
                sizes.push(
                    leaf_row
                        .get("samples")
                        .and_then(Value::as_u64)
                        .unwrap_or_default() as usize,
                );
                match leaf_row.get(&stderr_key).and_then(Value::as_f64) {
                    Some(stderr) => stderrs.push(stderr),
                    None => stderr_missing = true,
                }
            }
            let Some(value) =
                aggregate_subtask_metrics(&values, &sizes, metric_config.weight_by_size)
            else {
                continue;
            };
            let stderr = if stderr_missing {
                None
            } else {
                pooled_sample_stderr(&stderrs, &sizes)
            };
            let samples: usize = sizes.iter().sum();
            aggregated.push((metric_key.clone(), value, stderr_key, stderr, samples));
        }

        for (metric_key, value, stderr_key, stderr, samples) in aggregated {
            row.insert(metric_key, Value::from(value));
            row.insert(
                stderr_key,
                stderr.map_or_else(|| Value::String(NOT_AVAILABLE.to_string()), Value::from),
            );
            row.insert("samples".to_string(), Value::from(samples));
        }
        results.insert(node.name.clone(), row);
    }
    show_group_table
}

/// Merges the polarity of every leaf below each group into the group, starting from an
/// empty map per group. Conflicting polarities become `None`.
pub fn group_higher_is_better(
    hierarchy: &TaskHierarchy,
    higher_is_better: &mut BTreeMap<String, IndexMap<String, Option<bool>>>,
) {
    for (node, _) in hierarchy.groups() {
        let mut merged: IndexMap<String, Option<bool>> = IndexMap::new();
        for leaf in hierarchy.leaf_descendants(&node.name) {
            for (metric, higher) in higher_is_better.get(leaf).into_iter().flatten() {
                match merged.get(metric) {
                    None => {
                        merged.insert(metric.clone(), *higher);
                    }
                    Some(Some(current)) if Some(*current) != *higher => {
                        warn!(
                            "Higher_is_better values for metric {metric} in group {} are not consistent. Defaulting to None.",
                            node.name
                        );
                        merged.insert(metric.clone(), None);
                    }
                    Some(_) => {}
                }
            }
        }
        higher_is_better.insert(node.name.clone(), merged);
    }
}

/// Orders rows for display: siblings sorted by name, children right after their parent,
/// aliases indented by depth. Returns the task table and the table of groups that carry
/// aggregates.
pub fn prepare_print_tasks(
    hierarchy: &TaskHierarchy,
    results: &ResultTable,
) -> (ResultTable, ResultTable) {
    let mut task_agg = IndexMap::new();
    let mut group_agg = IndexMap::new();
    let order = hierarchy.task_order();
    let mut stack: Vec<&String> = sorted_desc(hierarchy.roots());
    while let Some(name) = stack.pop() {
        let Some(node) = hierarchy.get(name) else {
            continue;
        };
        let depth = order.get(name).copied().unwrap_or_default();
        let mut row = results.get(name).cloned().unwrap_or_default();
        let alias = row
            .get("alias")
            .and_then(Value::as_str)
            .unwrap_or(name.as_str())
            .to_string();
        let indent = if depth > 0 {
            format!("{}- ", " ".repeat(depth))
        } else {
            String::new()
        };
        row.insert("alias".to_string(), Value::String(format!("{indent}{alias}")));
        row.shift_remove("samples");

        if matches!(node.kind, NodeKind::Group(_)) {
            if !row.contains_key(HEADER_ONLY_KEY) {
                group_agg.insert(name.clone(), row.clone());
            }
            stack.extend(sorted_desc(&node.children));
        }
        task_agg.insert(name.clone(), row);
    }
    (task_agg, group_agg)
}

fn sorted_desc(names: &[String]) -> Vec<&String> {
    let mut names: Vec<&String> = names.iter().collect();
    names.sort_by(|a, b| b.cmp(a));
    names
}

/// Builds the result document on the coordinator. Computes each task's aggregates first.
#[instrument(skip_all, fields(tasks = task_outputs.len()))]
pub fn aggregate(
    task_outputs: &mut [TaskOutput],
    hierarchy: &TaskHierarchy,
    bootstrap_iters: usize,
    log_samples: bool,
) -> Result<EvaluationResults, Error> {
    for output in task_outputs.iter_mut() {
        output.calculate_aggregate_metric(bootstrap_iters)?;
    }
    let ConsolidatedResults {
        mut results,
        samples,
        configs,
        mut versions,
        n_shot,
        mut higher_is_better,
    } = consolidate_results(task_outputs);

    let show_group_table =
        consolidate_group_results(&mut results, &mut versions, hierarchy, task_outputs);
    let (results_agg, group_agg) = prepare_print_tasks(hierarchy, &results);
    group_higher_is_better(hierarchy, &mut higher_is_better);

    let n_samples = task_outputs
        .iter()
        .map(|output| {
            let original = output.eval_doc_count;
            let effective = output.limit.unwrap_or(original).min(original);
            (output.task_name.clone(), SampleCount { original, effective })
        })
        .collect();

    Ok(EvaluationResults {
        results: results_agg,
        groups: (show_group_table && !group_agg.is_empty()).then_some(group_agg),
        group_subtasks: hierarchy.subtask_list().into_iter().rev().collect(),
        configs,
        versions,
        n_shot,
        higher_is_better,
        n_samples,
        samples: log_samples.then_some(samples),
        config: None,
        date: None,
        git_hash: None,
    })
}
