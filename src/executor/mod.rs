//! Contract with the component that actually runs tasks
//!
//! The runtime hands every dispatched task to an [`Executor`] together with
//! a [`CompletionSink`]; the executor reports the outcome through the sink
//! whenever the task ends.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::CoreElement;
use crate::core::errors::Result;
use crate::graph::{AppId, BoundParameter, OnFailure, PlacementHints, TaskId, TaskOutcome};

pub mod local;
pub mod recording;

pub use local::{TaskBody, TokioExecutor};
pub use recording::RecordingExecutor;

/// Opaque id an executor assigns to a submission
pub type ExecutionHandle = u64;

/// Everything an executor needs to run one task attempt
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub id: TaskId,
    pub app_id: AppId,
    pub attempt: u32,
    pub core_element: Arc<CoreElement>,
    pub priority: i32,
    pub time_out: Option<Duration>,
    pub on_failure: OnFailure,
    pub has_target: bool,
    pub num_returns: usize,
    pub parameters: Vec<BoundParameter>,
    pub hints: PlacementHints,
}

impl DispatchedTask {
    pub fn signature(&self) -> &str {
        &self.core_element.signature
    }
}

type CompletionFn = dyn Fn(TaskId, TaskOutcome) -> Result<()> + Send + Sync;

/// Callback through which an executor reports task outcomes
#[derive(Clone)]
pub struct CompletionSink {
    callback: Arc<CompletionFn>,
}

impl CompletionSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(TaskId, TaskOutcome) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn complete(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        (self.callback)(task_id, outcome)
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionSink")
    }
}

/// Executor collaborator
pub trait Executor: Send + Sync {
    /// Start running `task`; its outcome must eventually reach `sink`
    fn submit(&self, task: DispatchedTask, sink: CompletionSink) -> Result<ExecutionHandle>;

    /// Best-effort cancellation of a submitted task
    fn request_cancel(&self, _handle: ExecutionHandle) {}
}
