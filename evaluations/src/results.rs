//! The result document produced by the coordinator, and its persistence.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};

/// Metric rows keyed by task or group name; each row maps `metric,filter` keys (plus `alias`)
/// to values.
pub type ResultTable = IndexMap<String, IndexMap<String, Value>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SampleCount {
    pub original: usize,
    pub effective: usize,
}

/// Run metadata recorded by `simple_evaluate`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunConfig {
    pub run_id: Uuid,
    pub model: String,
    pub model_args: Option<String>,
    pub device: String,
    pub world_size: usize,
    pub limit: Option<f64>,
    pub bootstrap_iters: usize,
    pub gen_kwargs: Option<String>,
    pub random_seed: Option<u64>,
    pub fewshot_random_seed: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct EvaluationResults {
    pub results: ResultTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<ResultTable>,
    pub group_subtasks: IndexMap<String, Vec<String>>,
    pub configs: BTreeMap<String, Value>,
    pub versions: BTreeMap<String, Value>,
    #[serde(rename = "n-shot")]
    pub n_shot: BTreeMap<String, usize>,
    pub higher_is_better: BTreeMap<String, IndexMap<String, Option<bool>>>,
    #[serde(rename = "n-samples")]
    pub n_samples: IndexMap<String, SampleCount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<IndexMap<String, Vec<Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Results,
    Groups,
}

fn file_io_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::new(ErrorDetails::FileIo {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Writes `results.json` (without samples) and one `<task>_samples.jsonl` per task.
pub async fn write_results(results: &EvaluationResults, output_dir: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| file_io_error(output_dir, e))?;

    let summary = EvaluationResults {
        samples: None,
        ..results.clone()
    };
    let path = output_dir.join("results.json");
    tokio::fs::write(&path, serde_json::to_string_pretty(&summary)?)
        .await
        .map_err(|e| file_io_error(&path, e))?;
    info!(path = %path.display(), "Wrote results");

    for (task_name, samples) in results.samples.iter().flatten() {
        let path = output_dir.join(format!("{task_name}_samples.jsonl"));
        let mut contents = String::new();
        for sample in samples {
            contents.push_str(&serde_json::to_string(sample)?);
            contents.push('\n');
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| file_io_error(&path, e))?;
        info!(path = %path.display(), samples = samples.len(), "Wrote samples");
    }
    Ok(())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Number(number) if number.is_f64() => {
            format!("{:.4}", number.as_f64().unwrap_or_default())
        }
        Value::String(s) => s.clone(),
        Value::Null => "N/A".to_string(),
        other => other.to_string(),
    }
}

/// Renders the results or groups table as markdown.
pub fn make_table(results: &EvaluationResults, kind: TableKind) -> String {
    let table = match kind {
        TableKind::Results => Some(&results.results),
        TableKind::Groups => results.groups.as_ref(),
    };
    let header = ["Tasks", "Version", "Filter", "n-shot", "Metric", "", "Value", "", "Stderr"];
    let mut out = format!("|{}|\n", header.join("|"));
    out.push_str(&format!("|{}|\n", vec!["---"; header.len()].join("|")));

    for (name, row) in table.into_iter().flatten() {
        let mut label = row
            .get("alias")
            .and_then(Value::as_str)
            .unwrap_or(name.as_str())
            .to_string();
        let mut version = results
            .versions
            .get(name)
            .map_or_else(|| "N/A".to_string(), format_value);
        let mut n_shot = results
            .n_shot
            .get(name)
            .map_or_else(String::new, ToString::to_string);
        let polarity = results.higher_is_better.get(name);

        let mut metric_keys: Vec<&String> = row.keys().filter(|key| *key != "alias").collect();
        metric_keys.sort();
        for key in metric_keys {
            let (metric, filter) = key.split_once(',').unwrap_or((key.as_str(), ""));
            if metric.ends_with("_stderr") {
                continue;
            }
            let arrow = match polarity.and_then(|p| p.get(metric)).copied().flatten() {
                Some(true) => "↑",
                Some(false) => "↓",
                None => "",
            };
            let value = row.get(key).map_or_else(String::new, format_value);
            let stderr_key = format!("{metric}_stderr,{filter}");
            let (plus_minus, stderr) = match row.get(&stderr_key) {
                Some(stderr) => ("±", format_value(stderr)),
                None => ("", String::new()),
            };
            out.push_str(&format!(
                "|{label}|{version}|{filter}|{n_shot}|{metric}|{arrow}|{value}|{plus_minus}|{stderr}|\n"
            ));
            label.clear();
            version.clear();
            n_shot.clear();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_results() -> EvaluationResults {
        let mut results = EvaluationResults::default();
        results.results.insert(
            "mme".to_string(),
            IndexMap::from([
                ("alias".to_string(), json!("mme")),
                ("exact_match,none".to_string(), json!(0.666_666_7)),
                ("exact_match_stderr,none".to_string(), json!(0.333_333_3)),
            ]),
        );
        results.versions.insert("mme".to_string(), json!("Yaml"));
        results.n_shot.insert("mme".to_string(), 0);
        results.higher_is_better.insert(
            "mme".to_string(),
            IndexMap::from([("exact_match".to_string(), Some(true))]),
        );
        results.n_samples.insert(
            "mme".to_string(),
            SampleCount {
                original: 3,
                effective: 3,
            },
        );
        results.samples = Some(IndexMap::from([(
            "mme".to_string(),
            vec![json!({"doc_id": 0}), json!({"doc_id": 1})],
        )]));
        results
    }

    #[test]
    fn test_serialized_keys() {
        let value = serde_json::to_value(sample_results()).unwrap();
        assert_eq!(value["n-samples"]["mme"], json!({"original": 3, "effective": 3}));
        assert_eq!(value["n-shot"]["mme"], json!(0));
        assert!(value.get("groups").is_none());
        assert!(value.get("date").is_none());
    }

    #[test]
    fn test_make_table() {
        let table = make_table(&sample_results(), TableKind::Results);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "|Tasks|Version|Filter|n-shot|Metric||Value||Stderr|");
        assert_eq!(lines[2], "|mme|Yaml|none|0|exact_match|↑|0.6667|±|0.3333|");
        assert_eq!(lines.len(), 3);
        assert_eq!(
            make_table(&sample_results(), TableKind::Groups).lines().count(),
            2
        );
    }

    #[tokio::test]
    async fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        write_results(&sample_results(), dir.path()).await.unwrap();
        let summary: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("results.json")).unwrap())
                .unwrap();
        assert!(summary.get("samples").is_none());
        assert_eq!(summary["results"]["mme"]["alias"], json!("mme"));
        let samples = std::fs::read_to_string(dir.path().join("mme_samples.jsonl")).unwrap();
        assert_eq!(samples, "{\"doc_id\":0}\n{\"doc_id\":1}\n");
    }
}
