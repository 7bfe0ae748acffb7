//! Fixtures shared by unit tests.

use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use serde_json::{Value, json};

use crate::instance::{Argument, Instance, OutputType, RequestType};
use crate::metric::{Aggregation, MetricValue};
use crate::shard::shard_indices;
use crate::task::{Document, Documents, Feature, Task, TaskConfig};

/// A generate-until task scoring exact string matches against `answer`.
pub struct ExactMatchTask {
    config: TaskConfig,
    docs: Documents,
    pub higher_is_better: bool,
    pub repeats: usize,
}

impl ExactMatchTask {
    pub fn new(name: &str, answers: &[&str]) -> Self {
        let rows = answers
            .iter()
            .enumerate()
            .map(|(i, answer)| {
                let Value::Object(doc) = json!({
                    "question": format!("q{i}"),
                    "answer": answer,
                    "image": format!("<image {i}>"),
                }) else {
                    return Document::new();
                };
                doc
            })
            .collect();
        let features = IndexMap::from([
            ("question".to_string(), Feature::Value("string".to_string())),
            ("answer".to_string(), Feature::Value("string".to_string())),
            ("image".to_string(), Feature::Image),
        ]);
        Self {
            config: TaskConfig::new(name, OutputType::GenerateUntil),
            docs: Documents::new(rows, features),
            higher_is_better: true,
            repeats: 1,
        }
    }
}

impl Task for ExactMatchTask {
    fn config(&self) -> &TaskConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut TaskConfig {
        &mut self.config
    }

    fn test_docs(&self) -> Option<&Documents> {
        Some(&self.docs)
    }

    fn build_all_requests(
        &mut self,
        limit: Option<usize>,
        rank: usize,
        world_size: usize,
    ) -> Result<Vec<Instance>> {
        Ok(shard_indices(self.docs.len(), limit, rank, world_size)
            .map(|doc_id| {
                Instance::new(
                    RequestType::GenerateUntil,
                    self.config.task.clone(),
                    doc_id,
                    0,
                    vec![Argument::from(format!("q{doc_id}"))],
                )
                .with_repeats(self.repeats)
            })
            .collect())
    }

    fn doc_to_target(&self, doc: &Document) -> Value {
        doc.get("answer").cloned().unwrap_or(Value::Null)
    }

    fn process_results(
        &self,
        doc: &Document,
        results: &[Value],
    ) -> Result<IndexMap<String, MetricValue>> {
        let prediction = results.first().ok_or_else(|| anyhow!("no results"))?;
        let hit = Some(prediction) == doc.get("answer");
        Ok(IndexMap::from([("exact_match".to_string(), hit.into())]))
    }

    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        IndexMap::from([("exact_match".to_string(), Aggregation::Mean)])
    }

    fn higher_is_better(&self) -> IndexMap<String, bool> {
        IndexMap::from([("exact_match".to_string(), self.higher_is_better)])
    }
}

/// Instances that already went through dispatch and the `none` filter.
pub fn answered_instances(task_name: &str, responses: &[(usize, &str)]) -> Vec<Instance> {
    responses
        .iter()
        .map(|(doc_id, response)| {
            let mut instance = Instance::new(
                RequestType::GenerateUntil,
                task_name,
                *doc_id,
                0,
                vec![Argument::from(format!("q{doc_id}"))],
            );
            instance.responses.push(json!(response));
            instance
                .filtered_responses
                .insert("none".to_string(), json!(response));
            instance
        })
        .collect()
}
