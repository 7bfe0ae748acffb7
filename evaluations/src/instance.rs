//! The unit of work handed to a model: one request plus the responses it accumulates.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The model capability a request needs.
///
/// The derived `Ord` fixes the order in which request types are dispatched, which
/// must be identical on every rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Loglikelihood,
    GenerateUntil,
    GenerateUntilMultiRound,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Loglikelihood => "loglikelihood",
            RequestType::GenerateUntil => "generate_until",
            RequestType::GenerateUntilMultiRound => "generate_until_multi_round",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The output type a task declares in its configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Loglikelihood,
    MultipleChoice,
    #[default]
    GenerateUntil,
    GenerateUntilMultiRound,
}

impl OutputType {
    /// Multiple-choice tasks decompose into one log-likelihood call per option.
    pub fn request_type(self) -> RequestType {
        match self {
            OutputType::Loglikelihood | OutputType::MultipleChoice => RequestType::Loglikelihood,
            OutputType::GenerateUntil => RequestType::GenerateUntil,
            OutputType::GenerateUntilMultiRound => RequestType::GenerateUntilMultiRound,
        }
    }
}

/// An in-process value passed through to the model untouched (image loaders, decoded
/// media, ...). Never serialized.
#[derive(Clone)]
pub struct OpaqueArgument {
    label: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl OpaqueArgument {
    pub fn new(label: impl Into<String>, value: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for OpaqueArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueArgument")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum Argument {
    Json(Value),
    Opaque(OpaqueArgument),
}

impl Argument {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Argument::Json(value) => Some(value),
            Argument::Opaque(_) => None,
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Json(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Json(Value::String(value.to_string()))
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Json(Value::String(value))
    }
}

/// What the model sees for one request.
#[derive(Clone, Debug)]
pub struct Request {
    pub task_name: String,
    pub doc_id: usize,
    pub idx: usize,
    pub arguments: Vec<Argument>,
}

impl Request {
    /// The arguments that survive serialization; opaque handles are dropped.
    pub fn json_arguments(&self) -> Vec<Value> {
        self.arguments
            .iter()
            .filter_map(Argument::as_json)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct Instance {
    pub request_type: RequestType,
    pub request: Request,
    pub repeats: usize,
    pub responses: Vec<Value>,
    pub filtered_responses: IndexMap<String, Value>,
}

impl Instance {
    pub fn new(
        request_type: RequestType,
        task_name: impl Into<String>,
        doc_id: usize,
        idx: usize,
        arguments: Vec<Argument>,
    ) -> Self {
        Self {
            request_type,
            request: Request {
                task_name: task_name.into(),
                doc_id,
                idx,
                arguments,
            },
            repeats: 1,
            responses: Vec::new(),
            filtered_responses: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats.max(1);
        self
    }

    pub fn doc_id(&self) -> usize {
        self.request.doc_id
    }

    pub fn idx(&self) -> usize {
        self.request.idx
    }
}
