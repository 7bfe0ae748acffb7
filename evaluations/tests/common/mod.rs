#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use indexmap::IndexMap;
use lmm_evaluations::shard::shard_indices;
use lmm_evaluations::{
    Aggregation, Argument, Document, Documents, Feature, Instance, MetricValue, Model,
    OutputType, ProcessGroup, Request, RequestType, Task, TaskConfig,
};
use serde_json::{Value, json};

/// A visual question answering task scored by exact match against `answer`.
pub struct VqaTask {
    config: TaskConfig,
    docs: Documents,
    higher_is_better: bool,
}

impl VqaTask {
    pub fn new(name: &str, answers: &[&str]) -> Self {
        let rows = answers
            .iter()
            .enumerate()
            .map(|(i, answer)| {
                json!({
                    "question": format!("What is shown in picture {i}?"),
                    "answer": answer,
                    "image": format!("<image {i}>"),
                })
                .as_object()
                .cloned()
                .unwrap()
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
        }
    }

    pub fn with_output_type(mut self, output_type: OutputType) -> Self {
        self.config.output_type = output_type;
        self
    }

    pub fn lower_is_better(mut self) -> Self {
        self.higher_is_better = false;
        self
    }
}

impl Task for VqaTask {
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
        let request_type = self.config.output_type.request_type();
        shard_indices(self.docs.len(), limit, rank, world_size)
            .map(|doc_id| {
                let doc = self
                    .docs
                    .get(doc_id)
                    .ok_or_else(|| anyhow!("missing document {doc_id}"))?;
                Ok(Instance::new(
                    request_type,
                    self.config.task.clone(),
                    doc_id,
                    0,
                    vec![
                        Argument::from(doc.get("question").cloned().unwrap_or(Value::Null)),
                        Argument::from(Value::Object(self.config.generation_kwargs.clone())),
                    ],
                ))
            })
            .collect()
    }

    fn doc_to_target(&self, doc: &Document) -> Value {
        doc.get("answer").cloned().unwrap_or(Value::Null)
    }

    fn process_results(
        &self,
        doc: &Document,
        results: &[Value],
    ) -> Result<IndexMap<String, MetricValue>> {
        if doc.contains_key("image") {
            return Err(anyhow!("image columns should not reach metric computation"));
        }
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

/// Answers generation requests from a fixed `(task, doc_id) -> answer` table and records the
/// size of every batch it receives.
pub struct ScriptedModel<G> {
    group: G,
    answers: HashMap<(String, usize), String>,
    pub batches: Mutex<Vec<usize>>,
}

impl<G: ProcessGroup> ScriptedModel<G> {
    pub fn new(group: G, answers: &[(&str, usize, &str)]) -> Self {
        Self {
            group,
            answers: answers
                .iter()
                .map(|(task, doc_id, answer)| ((task.to_string(), *doc_id), answer.to_string()))
                .collect(),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl<G: ProcessGroup> Model for ScriptedModel<G> {
    fn name(&self) -> &str {
        "scripted"
    }

    fn process_group(&self) -> &dyn ProcessGroup {
        &self.group
    }

    fn supports(&self, request_type: RequestType) -> bool {
        request_type == RequestType::GenerateUntil
    }

    async fn generate_until(&self, requests: &[Request]) -> Result<Vec<Value>> {
        self.batches.lock().unwrap().push(requests.len());
        Ok(requests
            .iter()
            .map(|request| {
                let answer = self
                    .answers
                    .get(&(request.task_name.clone(), request.doc_id))
                    .cloned()
                    .unwrap_or_default();
                Value::String(answer)
            })
            .collect())
    }
}
