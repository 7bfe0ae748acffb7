//! The task interface: documents in, requests out, metrics back.

use anyhow::{Result, anyhow, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::instance::{Instance, OutputType};
use crate::metric::{Aggregation, MetricValue};

/// One row of a task's dataset.
pub type Document = Map<String, Value>;

/// Column type of a dataset feature, as far as the evaluator cares.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Value(String),
    Image,
    Sequence(Box<Feature>),
}

impl Feature {
    /// Image columns and sequences of images are expensive to decode and are kept out of
    /// metric computation unless a task asks for them.
    pub fn is_image(&self) -> bool {
        match self {
            Feature::Image => true,
            Feature::Sequence(inner) => matches!(**inner, Feature::Image),
            Feature::Value(_) => false,
        }
    }
}

/// An in-memory split with its feature schema.
#[derive(Clone, Debug, Default)]
pub struct Documents {
    rows: Vec<Document>,
    features: IndexMap<String, Feature>,
}

impl Documents {
    pub fn new(rows: Vec<Document>, features: IndexMap<String, Feature>) -> Self {
        Self { rows, features }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, doc_id: usize) -> Option<&Document> {
        self.rows.get(doc_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.rows.iter()
    }

    pub fn features(&self) -> &IndexMap<String, Feature> {
        &self.features
    }

    pub fn image_columns(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, feature)| feature.is_image())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_alias: Option<String>,
    pub output_type: OutputType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_fewshot: Option<usize>,
    pub generation_kwargs: Map<String, Value>,
    pub process_results_use_image: bool,
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskConfig {
    pub fn new(task: impl Into<String>, output_type: OutputType) -> Self {
        Self {
            task: task.into(),
            output_type,
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove(key),
            _ => None,
        }
    }

    /// Sets `key` to `value`. With `update`, both the current and the new value must be
    /// mappings and the new entries are merged into the current ones.
    pub fn set(&mut self, key: &str, value: Value, update: bool) -> Result<()> {
        let Value::Object(mut map) = serde_json::to_value(&*self)? else {
            bail!("task config did not serialize to a mapping");
        };
        let value = if update {
            let Value::Object(new_entries) = value else {
                bail!("config key `{key}` can only be updated with a mapping");
            };
            let mut current = match map.remove(key) {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(current)) => current,
                Some(other) => bail!("config key `{key}` holds `{other}`, which is not a mapping"),
            };
            current.extend(new_entries);
            Value::Object(current)
        } else {
            value
        };
        map.insert(key.to_string(), value);
        *self = serde_json::from_value(Value::Object(map))
            .map_err(|e| anyhow!("invalid value for config key `{key}`: {e}"))?;
        Ok(())
    }
}

/// A benchmark task.
///
/// Implementations must shard documents with [`crate::shard::shard_indices`] when building
/// requests, so that result collection visits exactly the documents that were requested.
pub trait Task: Send + Sync {
    fn config(&self) -> &TaskConfig;

    fn config_mut(&mut self) -> &mut TaskConfig;

    fn name(&self) -> &str {
        &self.config().task
    }

    fn get_config(&self, key: &str) -> Option<Value> {
        self.config().get(key)
    }

    fn set_config(&mut self, key: &str, value: Value, update: bool) -> Result<()> {
        self.config_mut().set(key, value, update)
    }

    fn test_docs(&self) -> Option<&Documents>;

    fn validation_docs(&self) -> Option<&Documents> {
        None
    }

    /// The split that is evaluated: test documents when present, validation otherwise.
    fn eval_docs(&self) -> Option<&Documents> {
        self.test_docs().or_else(|| self.validation_docs())
    }

    fn build_all_requests(
        &mut self,
        limit: Option<usize>,
        rank: usize,
        world_size: usize,
    ) -> Result<Vec<Instance>>;

    /// Populates `filtered_responses`. The default pipeline is a single `none` filter that
    /// keeps the first response.
    fn apply_filters(&self, instances: &mut [Instance]) -> Result<()> {
        for instance in instances {
            let first = instance.responses.first().cloned().ok_or_else(|| {
                anyhow!(
                    "instance (doc_id={}, idx={}) has no responses",
                    instance.doc_id(),
                    instance.idx()
                )
            })?;
            instance.filtered_responses.insert("none".to_string(), first);
        }
        Ok(())
    }

    fn doc_to_target(&self, doc: &Document) -> Value;

    /// Computes the per-document metrics from the document and the filtered responses of
    /// all its instances, ordered by `idx`.
    fn process_results(
        &self,
        doc: &Document,
        results: &[Value],
    ) -> Result<IndexMap<String, MetricValue>>;

    fn aggregation(&self) -> IndexMap<String, Aggregation>;

    fn higher_is_better(&self) -> IndexMap<String, bool>;

    fn set_fewshot_seed(&mut self, seed: Option<u64>) {
        let _ = seed;
    }

    fn version(&self) -> Value {
        self.config()
            .metadata
            .get("version")
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn dump_config(&self) -> Value {
        serde_json::to_value(self.config()).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_image_columns() {
        let features = IndexMap::from([
            ("question".to_string(), Feature::Value("string".to_string())),
            ("image".to_string(), Feature::Image),
            (
                "frames".to_string(),
                Feature::Sequence(Box::new(Feature::Image)),
            ),
            (
                "options".to_string(),
                Feature::Sequence(Box::new(Feature::Value("string".to_string()))),
            ),
        ]);
        let docs = Documents::new(vec![], features);
        assert_eq!(docs.image_columns(), vec!["image", "frames"]);
        assert!(docs.is_empty());
    }

    #[test]
    fn test_config_get_and_replace() {
        let mut config = TaskConfig::new("mme", OutputType::GenerateUntil);
        assert_eq!(config.get("task"), Some(json!("mme")));
        assert_eq!(config.get("num_fewshot"), None);
        config.set("num_fewshot", json!(5), false).unwrap();
        assert_eq!(config.num_fewshot, Some(5));
        config.set("dataset_path", json!("lmms-lab/MME"), false).unwrap();
        assert_eq!(config.extra.get("dataset_path"), Some(&json!("lmms-lab/MME")));
    }

    #[test]
    fn test_config_update_merges_mappings() {
        let mut config = TaskConfig::new("mme", OutputType::GenerateUntil);
        config
            .set("generation_kwargs", json!({"max_new_tokens": 16}), true)
            .unwrap();
        config
            .set("generation_kwargs", json!({"temperature": 0.0}), true)
            .unwrap();
        assert_eq!(
            Value::Object(config.generation_kwargs.clone()),
            json!({"max_new_tokens": 16, "temperature": 0.0})
        );
        assert!(config.set("task", json!({"a": 1}), true).is_err());
    }

    #[test]
    fn test_config_rejects_ill_typed_values() {
        let mut config = TaskConfig::new("mme", OutputType::GenerateUntil);
        assert!(config.set("num_fewshot", json!("five"), false).is_err());
        assert_eq!(config.num_fewshot, None);
    }

    #[test]
    fn test_config_round_trips_output_type() {
        let config: TaskConfig = serde_json::from_value(json!({
            "task": "ai2d",
            "output_type": "multiple_choice",
            "metadata": {"version": 0.0}
        }))
        .unwrap();
        assert_eq!(config.output_type, OutputType::MultipleChoice);
        assert_eq!(config.metadata.get("version"), Some(&json!(0.0)));
    }
}
