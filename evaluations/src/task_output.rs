use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::EvaluationMode;
use crate::error::{Error, ErrorDetails};
use crate::instance::Instance;
use crate::metric::{Aggregation, MetricKey, MetricValue};
use crate::stats::MetricSummary;
use crate::task::{Document, Task};

/// The metric name used for every task in predict-only runs.
pub const BYPASS_METRIC: &str = "bypass";

/// One per-document metric value tagged with the document it came from.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DocMetric {
    pub doc_id: usize,
    pub value: MetricValue,
}

/// Everything the evaluator tracks for one leaf task during a run.
pub struct TaskOutput {
    pub task_name: String,
    pub group_name: Option<String>,
    pub task: Box<dyn Task>,
    pub mode: EvaluationMode,
    pub instances: Vec<Instance>,
    pub logged_samples: Vec<Value>,
    pub sample_metrics: BTreeMap<MetricKey, Vec<DocMetric>>,
    pub agg_metrics: IndexMap<String, Value>,
    pub sample_len: usize,
    pub eval_doc_count: usize,
    pub limit: Option<usize>,
}

impl std::fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOutput")
            .field("task_name", &self.task_name)
            .field("group_name", &self.group_name)
            .field("mode", &self.mode)
            .field("instances", &self.instances.len())
            .field("sample_metrics", &self.sample_metrics.keys().collect::<Vec<_>>())
            .field("agg_metrics", &self.agg_metrics)
            .finish_non_exhaustive()
    }
}

impl TaskOutput {
    pub fn new(task: Box<dyn Task>, group_name: Option<String>, mode: EvaluationMode) -> Self {
        let eval_doc_count = task.eval_docs().map_or(0, |docs| docs.len());
        Self {
            task_name: task.name().to_string(),
            group_name,
            task,
            mode,
            instances: Vec::new(),
            logged_samples: Vec::new(),
            sample_metrics: BTreeMap::new(),
            agg_metrics: IndexMap::new(),
            sample_len: 0,
            eval_doc_count,
            limit: None,
        }
    }

    pub fn aggregation(&self) -> IndexMap<String, Aggregation> {
        match self.mode {
            EvaluationMode::Normal => self.task.aggregation(),
            EvaluationMode::PredictOnly => {
                IndexMap::from([(BYPASS_METRIC.to_string(), Aggregation::Bypass)])
            }
        }
    }

    pub fn higher_is_better(&self) -> IndexMap<String, bool> {
        match self.mode {
            EvaluationMode::Normal => self.task.higher_is_better(),
            EvaluationMode::PredictOnly => IndexMap::from([(BYPASS_METRIC.to_string(), true)]),
        }
    }

    /// Per-document metrics; predict-only runs record a null `bypass` value instead of
    /// calling the task.
    pub fn process_results(
        &self,
        doc: &Document,
        results: &[Value],
    ) -> anyhow::Result<IndexMap<String, MetricValue>> {
        match self.mode {
            EvaluationMode::Normal => self.task.process_results(doc, results),
            EvaluationMode::PredictOnly => Ok(IndexMap::from([(
                BYPASS_METRIC.to_string(),
                MetricValue::Opaque(Value::Null),
            )])),
        }
    }

    pub fn n_shot(&self) -> usize {
        self.task.config().num_fewshot.unwrap_or(0)
    }

    pub fn alias(&self) -> Option<&str> {
        self.task.config().task_alias.as_deref()
    }

    /// Folds every `(metric, filter)` list into `agg_metrics`.
    ///
    /// Values are ordered by document before aggregation, so the result (including the
    /// seeded bootstrap) does not depend on how documents were split across ranks.
    pub fn calculate_aggregate_metric(&mut self, bootstrap_iters: usize) -> Result<(), Error> {
        let aggregations = self.aggregation();
        for (key, entries) in &mut self.sample_metrics {
            let Some(aggregation) = aggregations.get(&key.metric) else {
                return Err(Error::new(ErrorDetails::MissingAggregation {
                    task_name: self.task_name.clone(),
                    metric: key.metric.clone(),
                }));
            };
            entries.sort_by_key(|entry| entry.doc_id);
            let values: Vec<MetricValue> = entries.iter().map(|entry| entry.value.clone()).collect();
            let aggregation_error = |e: anyhow::Error| {
                Error::new(ErrorDetails::Aggregation {
                    task_name: self.task_name.clone(),
                    metric: key.to_string(),
                    message: e.to_string(),
                })
            };
            let value = aggregation.aggregate(&values).map_err(aggregation_error)?;
            let stderr = aggregation
                .stderr(&values, bootstrap_iters)
                .map_err(aggregation_error)?;
            if let Some(value) = value.as_f64() {
                debug!(
                    task_name = %self.task_name,
                    metric = %key,
                    summary = %MetricSummary { value, stderr, count: values.len() },
                    "Aggregated metric"
                );
            }
            self.agg_metrics.insert(key.to_string(), value);
            self.agg_metrics.insert(
                key.stderr_key(),
                stderr.map_or_else(|| Value::String("N/A".to_string()), Value::from),
            );
            self.sample_len = values.len();
        }
        Ok(())
    }
}
