use thiserror::Error;

use crate::data::{DataId, Producer};
use crate::graph::{AppId, TaskId};

/// Unified error type for the taskweave runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Malformed implementation constraint at registration; nothing is mutated
    #[error("Invalid constraint for implementation {implementation}: {reason}")]
    InvalidConstraint {
        implementation: String,
        reason: String,
    },

    /// Registration request that is not about constraints (empty signature, no implementations)
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// A pending version of `data` is held by another unfinished producer.
    /// The graph builder turns this into a dependency edge.
    #[error("Concurrent write on {data}: version {version} is still pending on {producer}")]
    ConcurrentWriteConflict {
        data: DataId,
        version: u64,
        producer: Producer,
    },

    /// Delete or close against data with an unfinished producer and no wait requested
    #[error("Data {data} is busy: version {version} has an unfinished producer")]
    DataBusy { data: DataId, version: u64 },

    /// The producer of the requested version failed
    #[error("Producer {producer} of {data} version {version} failed")]
    ProducerFailed {
        data: DataId,
        version: u64,
        producer: Producer,
    },

    #[error("Task group '{name}' is already open for application {app_id}")]
    DuplicateGroup { app_id: AppId, name: String },

    #[error("Unknown task group '{name}' for application {app_id}")]
    UnknownGroup { app_id: AppId, name: String },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Unknown data: {0}")]
    UnknownData(DataId),

    #[error("Unknown core element: {0}")]
    UnknownCoreElement(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid access to {data}: {reason}")]
    InvalidAccess { data: DataId, reason: String },

    /// The application declared that no more tasks would be submitted
    #[error("Application {0} accepts no more tasks")]
    ApplicationSealed(AppId),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Runtime is shut down")]
    SystemShutdown,

    /// Structural inconsistency of the graph (double completion, completion
    /// of a task that was never dispatched)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Create a constraint error for an implementation
    pub fn invalid_constraint<S: Into<String>, R: Into<String>>(implementation: S, reason: R) -> Self {
        Self::InvalidConstraint {
            implementation: implementation.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_access<R: Into<String>>(data: &DataId, reason: R) -> Self {
        Self::InvalidAccess {
            data: data.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_task<S: Into<String>>(message: S) -> Self {
        Self::InvalidTask(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Fatal errors mean the engine's own bookkeeping is broken
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Errors a caller may resolve by waiting and retrying the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DataBusy { .. } | Self::ConcurrentWriteConflict { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConstraint { .. } | Self::InvalidRegistration(_) => "registration",
            Self::ConcurrentWriteConflict { .. }
            | Self::DataBusy { .. }
            | Self::ProducerFailed { .. }
            | Self::UnknownData(_)
            | Self::InvalidAccess { .. } => "data",
            Self::DuplicateGroup { .. } | Self::UnknownGroup { .. } => "group",
            Self::UnknownTask(_)
            | Self::UnknownCoreElement(_)
            | Self::InvalidTask(_)
            | Self::ApplicationSealed(_) => "task",
            Self::Configuration(_) => "configuration",
            Self::SystemShutdown => "lifecycle",
            Self::InvariantViolation(_) => "internal",
            Self::Io(_) => "io",
            Self::Yaml(_) | Self::Json(_) => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RuntimeError>;
