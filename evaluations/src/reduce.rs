//! Moves every rank's per-document metrics and logged samples to the coordinator.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::distributed::{ProcessGroup, Tensor, all_gather, gather_to};
use crate::error::Error;
use crate::metric::{MetricKey, MetricKind, MetricValue};
use crate::task_output::{DocMetric, TaskOutput};

/// Fills numeric rows of ranks that had fewer documents.
pub const PAD_VALUE: f64 = f64::MIN;

/// Gathers `task_output`'s samples and metric lists onto `coordinator` in rank-major order.
/// Other ranks are left with empty lists. Every rank must call this for every task.
#[instrument(skip_all, fields(task_name = %task_output.task_name, rank = group.rank()))]
pub async fn reduce_task_output(
    group: &dyn ProcessGroup,
    task_output: &mut TaskOutput,
    log_samples: bool,
    coordinator: usize,
) -> Result<(), Error> {
    if log_samples {
        let local_samples = std::mem::take(&mut task_output.logged_samples);
        if let Some(per_rank) = gather_to(group, &local_samples, coordinator).await? {
            task_output.logged_samples = per_rank.into_iter().flatten().collect::<Vec<Value>>();
        }
    }

    let local_keys: Vec<MetricKey> = task_output.sample_metrics.keys().cloned().collect();
    let all_keys: BTreeSet<MetricKey> = all_gather(group, &local_keys)
        .await?
        .into_iter()
        .flatten()
        .collect();

    for key in all_keys {
        let entries = task_output.sample_metrics.remove(&key).unwrap_or_default();
        // A rank whose own values mix kinds reports `Opaque`. Ranks with no values for
        // this key still take part in every collective below.
        let local_kind = entries.first().map(|first| {
            let kind = first.value.kind();
            if entries.iter().all(|entry| entry.value.kind() == kind) {
                kind
            } else {
                MetricKind::Opaque
            }
        });
        let kinds: BTreeSet<MetricKind> = all_gather(group, &local_kind)
            .await?
            .into_iter()
            .flatten()
            .collect();
        let kind = match kinds.len() {
            0 => continue,
            1 => kinds.first().copied().unwrap_or(MetricKind::Opaque),
            _ => {
                debug!(metric = %key, ?kinds, "Mixed value kinds; gathering as JSON");
                MetricKind::Opaque
            }
        };

        let gathered = match kind.numeric_width() {
            None => gather_to(group, &entries, coordinator)
                .await?
                .map(|per_rank| per_rank.into_iter().flatten().collect::<Vec<DocMetric>>()),
            Some(_) => Some(reduce_numeric(group, &entries, kind).await?),
        };
        if group.rank() == coordinator
            && let Some(gathered) = gathered
        {
            debug!(metric = %key, values = gathered.len(), "Reduced metric");
            task_output.sample_metrics.insert(key, gathered);
        }
    }

    group.barrier().await
}

/// Encodes values as `[values.., doc_id]` rows, pads every rank to the longest row count
/// with `PAD_VALUE` and gathers. Padding rows are recognized by their doc id column.
async fn reduce_numeric(
    group: &dyn ProcessGroup,
    entries: &[DocMetric],
    kind: MetricKind,
) -> Result<Vec<DocMetric>, Error> {
    let width = kind.numeric_width().unwrap_or(1);
    let mut tensor = Tensor::new(width + 1);
    for entry in entries {
        let mut row = match &entry.value {
            MetricValue::Scalar(value) => vec![*value],
            MetricValue::Tuple(values) => values.clone(),
            MetricValue::Opaque(_) => Vec::new(),
        };
        row.push(entry.doc_id as f64);
        tensor.push_row(&row)?;
    }
    let padded = group.pad_across_processes(tensor, PAD_VALUE).await?;
    let gathered = group.gather(padded).await?;
    Ok(gathered
        .iter_rows()
        .filter(|row| row[width] != PAD_VALUE)
        .map(|row| DocMetric {
            doc_id: row[width] as usize,
            value: match kind {
                MetricKind::Scalar => MetricValue::Scalar(row[0]),
                MetricKind::Tuple(_) | MetricKind::Opaque => {
                    MetricValue::Tuple(row[..width].to_vec())
                }
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::EvaluationMode;
    use crate::distributed::LocalProcessGroup;
    use crate::testing::ExactMatchTask;

    fn output_with(key: &MetricKey, entries: Vec<DocMetric>) -> TaskOutput {
        let mut output = TaskOutput::new(
            Box::new(ExactMatchTask::new("em", &["a", "b", "c", "d"])),
            None,
            EvaluationMode::Normal,
        );
        if !entries.is_empty() {
            output.sample_metrics.insert(key.clone(), entries);
        }
        output
    }

    fn doc_metric(doc_id: usize, value: impl Into<MetricValue>) -> DocMetric {
        DocMetric {
            doc_id,
            value: value.into(),
        }
    }

    /// Runs the reducer on `per_rank.len()` ranks and returns each rank's result.
    async fn reduce_on_ranks(
        key: &MetricKey,
        per_rank: Vec<Vec<DocMetric>>,
        samples: Vec<Vec<Value>>,
    ) -> Vec<Result<TaskOutput, Error>> {
        let groups = LocalProcessGroup::new_group(per_rank.len());
        let handles: Vec<_> = groups
            .into_iter()
            .zip(per_rank.into_iter().zip(samples))
            .map(|(group, (entries, samples))| {
                let key = key.clone();
                tokio::spawn(async move {
                    let mut output = output_with(&key, entries);
                    output.logged_samples = samples;
                    reduce_task_output(&group, &mut output, true, 0)
                        .await
                        .map(|()| output)
                })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_scalars_are_concatenated_rank_major() {
        let key = MetricKey::new("exact_match", "none");
        let results = reduce_on_ranks(
            &key,
            vec![
                vec![doc_metric(0, 1.0), doc_metric(2, 1.0)],
                vec![doc_metric(1, 0.0)],
            ],
            vec![vec![json!({"doc_id": 0}), json!({"doc_id": 2})], vec![json!({"doc_id": 1})]],
        )
        .await;
        let mut results = results.into_iter().map(Result::unwrap);
        let coordinator = results.next().unwrap();
        assert_eq!(
            coordinator.sample_metrics[&key],
            vec![doc_metric(0, 1.0), doc_metric(2, 1.0), doc_metric(1, 0.0)]
        );
        let sample_ids: Vec<&Value> = coordinator
            .logged_samples
            .iter()
            .map(|sample| &sample["doc_id"])
            .collect();
        assert_eq!(sample_ids, vec![&json!(0), &json!(2), &json!(1)]);
        let other = results.next().unwrap();
        assert!(other.sample_metrics.is_empty());
        assert!(other.logged_samples.is_empty());
    }

    #[tokio::test]
    async fn test_tuples_keep_their_width() {
        let key = MetricKey::new("f1_parts", "none");
        let tuple = |doc_id, a, b| DocMetric {
            doc_id,
            value: MetricValue::Tuple(vec![a, b]),
        };
        let results = reduce_on_ranks(
            &key,
            vec![vec![tuple(0, 1.0, 2.0)], vec![tuple(1, 3.0, 4.0), tuple(3, 5.0, 6.0)]],
            vec![vec![], vec![]],
        )
        .await;
        let coordinator = results.into_iter().next().unwrap().unwrap();
        assert_eq!(
            coordinator.sample_metrics[&key],
            vec![tuple(0, 1.0, 2.0), tuple(1, 3.0, 4.0), tuple(3, 5.0, 6.0)]
        );
    }

    #[tokio::test]
    async fn test_opaque_values_and_empty_ranks() {
        let key = MetricKey::new("prediction", "none");
        let results = reduce_on_ranks(
            &key,
            vec![
                vec![],
                vec![doc_metric(1, json!({"pred": "A"}))],
                vec![doc_metric(2, json!("B"))],
            ],
            vec![vec![], vec![], vec![]],
        )
        .await;
        let coordinator = results.into_iter().next().unwrap().unwrap();
        assert_eq!(
            coordinator.sample_metrics[&key],
            vec![
                doc_metric(1, json!({"pred": "A"})),
                doc_metric(2, json!("B"))
            ]
        );
    }

    #[tokio::test]
    async fn test_total_length_is_preserved() {
        let key = MetricKey::new("exact_match", "none");
        let per_rank = vec![
            (0..5).map(|i| doc_metric(i * 3, 1.0)).collect(),
            (0..2).map(|i| doc_metric(i * 3 + 1, 0.0)).collect(),
            vec![],
        ];
        let results = reduce_on_ranks(&key, per_rank, vec![vec![], vec![], vec![]]).await;
        let coordinator = results.into_iter().next().unwrap().unwrap();
        assert_eq!(coordinator.sample_metrics[&key].len(), 7);
    }

    #[tokio::test]
    async fn test_kind_disagreement_across_ranks_falls_back_to_json() {
        let key = MetricKey::new("exact_match", "none");
        let results = reduce_on_ranks(
            &key,
            vec![vec![doc_metric(0, 1.0)], vec![doc_metric(1, json!("yes"))]],
            vec![vec![], vec![]],
        )
        .await;
        let mut results = results.into_iter().map(Result::unwrap);
        let coordinator = results.next().unwrap();
        assert_eq!(
            coordinator.sample_metrics[&key],
            vec![doc_metric(0, 1.0), doc_metric(1, json!("yes"))]
        );
        assert!(results.next().unwrap().sample_metrics.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_kinds_on_one_rank_finish_on_every_rank() {
        let key = MetricKey::new("exact_match", "none");
        let results = reduce_on_ranks(
            &key,
            vec![
                vec![doc_metric(0, 1.0), doc_metric(2, Value::Null)],
                vec![doc_metric(1, 0.0)],
            ],
            vec![vec![], vec![]],
        )
        .await;
        let mut results = results.into_iter().map(Result::unwrap);
        let coordinator = results.next().unwrap();
        assert_eq!(
            coordinator.sample_metrics[&key],
            vec![
                doc_metric(0, 1.0),
                doc_metric(2, Value::Null),
                doc_metric(1, 0.0)
            ]
        );
        assert!(results.next().unwrap().sample_metrics.is_empty());
    }
}
