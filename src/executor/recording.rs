use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{CompletionSink, DispatchedTask, ExecutionHandle, Executor};
use crate::core::errors::{Result, RuntimeError};
use crate::graph::{TaskId, TaskOutcome};

struct Submission {
    handle: ExecutionHandle,
    task: DispatchedTask,
    sink: CompletionSink,
}

/// Passive executor: keeps whatever it is handed and only completes a task
/// when told to. Used to drive the runtime step by step.
pub struct RecordingExecutor {
    submissions: Mutex<Vec<Submission>>,
    cancel_requests: Mutex<Vec<ExecutionHandle>>,
    next_handle: AtomicU64,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            cancel_requests: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Tasks submitted and not yet completed, in submission order
    pub fn submitted(&self) -> Vec<DispatchedTask> {
        self.submissions
            .lock()
            .iter()
            .map(|submission| submission.task.clone())
            .collect()
    }

    pub fn submitted_ids(&self) -> Vec<TaskId> {
        self.submissions
            .lock()
            .iter()
            .map(|submission| submission.task.id)
            .collect()
    }

    pub fn handle_of(&self, id: TaskId) -> Option<ExecutionHandle> {
        self.submissions
            .lock()
            .iter()
            .find(|submission| submission.task.id == id)
            .map(|submission| submission.handle)
    }

    pub fn cancel_requests(&self) -> Vec<ExecutionHandle> {
        self.cancel_requests.lock().clone()
    }

    /// Report the outcome of a held task
    pub fn complete(&self, id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let submission = {
            let mut submissions = self.submissions.lock();
            let index = submissions
                .iter()
                .position(|submission| submission.task.id == id)
                .ok_or(RuntimeError::UnknownTask(id))?;
            submissions.remove(index)
        };
        debug!(task_id = id, ?outcome, "Completing recorded task");
        submission.sink.complete(id, outcome)
    }

    pub fn succeed(&self, id: TaskId) -> Result<()> {
        self.complete(id, TaskOutcome::Success)
    }

    pub fn fail(&self, id: TaskId, reason: &str) -> Result<()> {
        self.complete(id, TaskOutcome::Failure(reason.to_string()))
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for RecordingExecutor {
    fn submit(&self, task: DispatchedTask, sink: CompletionSink) -> Result<ExecutionHandle> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = task.id, handle, "Recorded submission");
        self.submissions.lock().push(Submission { handle, task, sink });
        Ok(handle)
    }

    fn request_cancel(&self, handle: ExecutionHandle) {
        self.cancel_requests.lock().push(handle);
    }
}
