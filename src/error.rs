use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ResumeSuggestion;

/// Invalid runner configuration, rejected before anything is scheduled.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_workers should be positive, got {0}")]
    MaxWorkers(usize),

    #[error("Invalid log filter '{filter}': {message}")]
    LogFilter { filter: String, message: String },
}

/// The task graph could not be built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Task '{0}' is defined more than once")]
    DuplicateTask(String),

    #[error("Output '{output}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        output: String,
        first: String,
        second: String,
    },

    #[error("Cycle detected in task graph at task '{task}'")]
    Cycle { task: String },

    #[error("Task '{0}' not found in pipeline")]
    UnknownTask(String),
}

/// Errors raised by a catalog or one of its datasets.
///
/// Unlike most errors in this crate these are plain data, so a worker process
/// can send them back to the parent unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogError {
    #[error("Dataset '{name}' not found in the catalog")]
    NotFound { name: String },

    #[error("Dataset '{name}': {message}")]
    Unsupported { name: String, message: String },

    #[error(
        "Dataset '{name}': {type_name} cannot be serialized. Process workers can only \
         exchange values of registered types"
    )]
    NotSerializable { name: String, type_name: String },

    #[error("Expected a value of type {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Dataset '{name}':\n{message}")]
    Dataset { name: String, message: String },

    #[error("Catalog proxy failure: {0}")]
    Proxy(String),
}

/// A task or an artifact can't cross the process boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error(
        "Task '{task}' is built from a closure and cannot be sent to a worker process. \
         Register its function in the Registry instead"
    )]
    Task { task: String },

    #[error("Task '{task}' uses function '{key}' which is not present in the registry")]
    Function { task: String, key: String },

    #[error("Dataset '{name}' holds a {type_name} which cannot be serialized")]
    Value { name: String, type_name: String },
}

/// Failure of the worker wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode frame: {0}")]
    Encode(String),

    #[error("Couldn't decode frame: {0}")]
    Decode(String),

    #[error("Unexpected message from peer: {0}")]
    Unexpected(&'static str),
}

/// The reason a single task did not complete.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The computation itself returned an error.
    #[error(transparent)]
    Failed(anyhow::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task returned {found} outputs, but declares {expected}")]
    Arity { expected: usize, found: usize },

    #[error("Couldn't spawn worker process")]
    Spawn(#[source] std::io::Error),

    #[error("Worker protocol failure")]
    Protocol(#[from] ProtocolError),

    #[error("Worker process exited unexpectedly")]
    WorkerExited,
}

/// Everything [`Runner::run`](crate::Runner::run) can fail with.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Pipeline input(s) {0:?} not found in the catalog")]
    MissingInputs(Vec<String>),

    #[error("Unable to schedule new tasks although some tasks have not run: {stuck:?}")]
    Unschedulable { stuck: Vec<String>, done: Vec<String> },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Task '{task}' failed:\n{source}")]
    Task {
        task: String,
        #[source]
        source: TaskError,
        resume: ResumeSuggestion,
    },

    #[error("Couldn't build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't determine worker executable")]
    WorkerCommand(#[source] std::io::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl RunError {
    /// Completed tasks recorded when a task failed.
    pub fn resume(&self) -> Option<&ResumeSuggestion> {
        match self {
            RunError::Task { resume, .. } => Some(resume),
            _ => None,
        }
    }
}
