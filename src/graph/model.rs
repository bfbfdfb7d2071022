use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RuntimeError};
use crate::data::{DataId, DataKind, DataLocation, Direction};

// Type aliases
pub type TaskId = u64;
pub type AppId = u64;

/// What happens to a task and its dependents when it fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OnFailure {
    /// Resubmit, bounded by `max_retries`, then behave as `Fail`
    #[default]
    Retry,
    /// Cancel every transitive successor
    CancelSuccessor,
    /// Mark failed; dependents fail fast instead of running
    Fail,
    /// Behave as if the task finished without changing its outputs
    Ignore,
}

impl FromStr for OnFailure {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "RETRY" => Ok(Self::Retry),
            "CANCEL_SUCCESSOR" | "CANCEL_SUCCESSORS" => Ok(Self::CancelSuccessor),
            "FAIL" => Ok(Self::Fail),
            "IGNORE" => Ok(Self::Ignore),
            other => Err(RuntimeError::invalid_task(format!(
                "unknown failure policy '{}'",
                other
            ))),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    File,
    Object,
    Scalar,
}

/// A declared task parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub direction: Direction,
    pub kind: ParameterKind,
    /// Data name; absent for scalars
    pub data: Option<String>,
    /// Marshalled scalar value, opaque to the runtime
    pub value: Option<String>,
}

impl Parameter {
    pub fn file<S: Into<String>>(direction: Direction, name: S) -> Self {
        Self {
            direction,
            kind: ParameterKind::File,
            data: Some(name.into()),
            value: None,
        }
    }

    pub fn object<S: Into<String>>(direction: Direction, name: S) -> Self {
        Self {
            direction,
            kind: ParameterKind::Object,
            data: Some(name.into()),
            value: None,
        }
    }

    pub fn scalar<S: Into<String>>(value: S) -> Self {
        Self {
            direction: Direction::In,
            kind: ParameterKind::Scalar,
            data: None,
            value: Some(value.into()),
        }
    }

    pub fn data_id(&self) -> Option<DataId> {
        let name = self.data.as_ref()?;
        match self.kind {
            ParameterKind::File => Some(DataId {
                kind: DataKind::File,
                name: name.clone(),
            }),
            ParameterKind::Object => Some(DataId {
                kind: DataKind::Object,
                name: name.clone(),
            }),
            ParameterKind::Scalar => None,
        }
    }
}

/// A parameter together with the versions it was bound to at submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundParameter {
    pub parameter: Parameter,
    pub data: Option<DataId>,
    pub read: Option<BoundVersion>,
    pub write: Option<BoundVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundVersion {
    pub number: u64,
    pub location: DataLocation,
}

/// Placement metadata of the extended submission call. Passed through to
/// the executor untouched; one graph node per submission regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementHints {
    pub num_nodes: u32,
    pub replicated: bool,
    pub distributed: bool,
}

impl Default for PlacementHints {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            replicated: false,
            distributed: false,
        }
    }
}

/// Submission request for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub app_id: AppId,
    /// Core element signature
    pub signature: String,
    pub priority: i32,
    pub time_out: Option<Duration>,
    pub on_failure: OnFailure,
    pub has_target: bool,
    pub num_returns: usize,
    pub parameters: Vec<Parameter>,
    pub hints: PlacementHints,
}

impl TaskSpec {
    pub fn new<S: Into<String>>(app_id: AppId, signature: S) -> Self {
        Self {
            app_id,
            signature: signature.into(),
            priority: 0,
            time_out: None,
            on_failure: OnFailure::default(),
            has_target: false,
            num_returns: 0,
            parameters: Vec::new(),
            hints: PlacementHints::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_out(mut self, time_out: Duration) -> Self {
        self.time_out = Some(time_out);
        self
    }

    pub fn with_on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_target(mut self) -> Self {
        self.has_target = true;
        self
    }

    pub fn with_returns(mut self, num_returns: usize) -> Self {
        self.num_returns = num_returns;
        self
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_hints(mut self, hints: PlacementHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.signature.trim().is_empty() {
            return Err(RuntimeError::invalid_task("empty core element signature"));
        }
        for (index, parameter) in self.parameters.iter().enumerate() {
            match parameter.kind {
                ParameterKind::Scalar if parameter.direction.writes() => {
                    return Err(RuntimeError::invalid_task(format!(
                        "parameter {} is a scalar declared {:?}",
                        index, parameter.direction
                    )));
                }
                ParameterKind::File | ParameterKind::Object
                    if parameter.data.as_deref().map_or(true, str::is_empty) =>
                {
                    return Err(RuntimeError::invalid_task(format!(
                        "parameter {} has no data name",
                        index
                    )));
                }
                _ => {}
            }
        }
        let data_parameters = self
            .parameters
            .iter()
            .filter(|p| p.kind != ParameterKind::Scalar)
            .count();
        if self.has_target && data_parameters == 0 {
            return Err(RuntimeError::invalid_task("target declared without a data parameter"));
        }
        if self.num_returns > self.parameters.len() {
            return Err(RuntimeError::invalid_task(format!(
                "{} returns declared for {} parameters",
                self.num_returns,
                self.parameters.len()
            )));
        }
        if self.hints.num_nodes == 0 {
            return Err(RuntimeError::invalid_task("num_nodes must be at least 1"));
        }
        Ok(())
    }
}

/// Outcome reported by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success,
    Failure(String),
    /// The executor honoured a cancellation request
    Cancelled,
}

impl TaskOutcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure("task reported failure".to_string())
        }
    }
}
