use thiserror::Error as ThisError;

use crate::instance::RequestType;

#[derive(Debug)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    #[must_use]
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    #[must_use]
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    #[must_use]
    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    #[must_use]
    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, ThisError)]
pub enum ErrorDetails {
    #[error("No tasks specified, or no tasks found. Please verify the task names.")]
    EmptyTaskList,
    #[error("Task or group `{name}` appears more than once in the task hierarchy")]
    DuplicateTaskName { name: String },
    #[error("log_samples must be enabled for predict-only task `{task_name}`")]
    BypassRequiresLogSamples { task_name: String },
    #[error("Invalid configuration: {message}")]
    Config { message: String },
    #[error("Task `{task_name}` has neither test nor validation documents")]
    MissingEvalSplit { task_name: String },
    #[error("Model does not support `{request_type}` requests needed by task `{task_name}`")]
    UnsupportedRequestType {
        task_name: String,
        request_type: RequestType,
    },
    #[error(
        "Model returned {actual} responses for {expected} `{request_type}` requests; the backend is malformed"
    )]
    ResponseCountMismatch {
        request_type: RequestType,
        expected: usize,
        actual: usize,
    },
    #[error("Model failed on `{request_type}` requests: {message}")]
    Backend {
        request_type: RequestType,
        message: String,
    },
    #[error("Collective operation `{operation}` failed on rank {rank}: {message}")]
    Collective {
        operation: String,
        rank: usize,
        message: String,
    },
    #[error("Tensor row has width {actual}, expected {expected}")]
    TensorShape { expected: usize, actual: usize },
    #[error("Task `{task_name}` failed to build requests: {message}")]
    BuildRequests { task_name: String, message: String },
    #[error("Task `{task_name}` failed to apply filters: {message}")]
    ApplyFilters { task_name: String, message: String },
    #[error("Instance (doc_id={doc_id}, idx={idx}) of task `{task_name}` has no `{filter}` filtered response")]
    MissingFilteredResponse {
        task_name: String,
        doc_id: usize,
        idx: usize,
        filter: String,
    },
    #[error("Task `{task_name}` failed to process results for doc_id={doc_id}: {message}")]
    ProcessResults {
        task_name: String,
        doc_id: usize,
        message: String,
    },
    #[error("Task `{task_name}` declares no aggregation for metric `{metric}`")]
    MissingAggregation { task_name: String, metric: String },
    #[error("Task `{task_name}` failed to aggregate metric `{metric}`: {message}")]
    Aggregation {
        task_name: String,
        metric: String,
        message: String,
    },
    #[error("Error reading or writing `{path}`: {message}")]
    FileIo { path: String, message: String },
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl ErrorDetails {
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::EmptyTaskList
            | ErrorDetails::DuplicateTaskName { .. }
            | ErrorDetails::BypassRequiresLogSamples { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::MissingEvalSplit { .. }
            | ErrorDetails::UnsupportedRequestType { .. }
            | ErrorDetails::ResponseCountMismatch { .. }
            | ErrorDetails::Backend { .. }
            | ErrorDetails::Collective { .. }
            | ErrorDetails::TensorShape { .. }
            | ErrorDetails::BuildRequests { .. }
            | ErrorDetails::ApplyFilters { .. }
            | ErrorDetails::MissingFilteredResponse { .. }
            | ErrorDetails::ProcessResults { .. }
            | ErrorDetails::MissingAggregation { .. }
            | ErrorDetails::Aggregation { .. }
            | ErrorDetails::FileIo { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::WARN,
        }
    }

    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}
