use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{CompletionSink, DispatchedTask, ExecutionHandle, Executor};
use crate::catalog::{Constraints, Implementation};
use crate::core::errors::{Result, RuntimeError};
use crate::graph::TaskOutcome;

/// User code run for one implementation of a core element
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self, task: &DispatchedTask) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> TaskBody for F
where
    F: Fn(&DispatchedTask) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, task: &DispatchedTask) -> anyhow::Result<()> {
        self(task)
    }
}

/// Executor running task bodies on a tokio runtime.
///
/// Bodies are looked up by implementation signature first, then by the
/// core element signature. With a capacity set, only implementations whose
/// constraints fit it are considered.
pub struct TokioExecutor {
    runtime: Handle,
    bodies: DashMap<String, Arc<dyn TaskBody>>,
    capacity: Option<Constraints>,
    running: Arc<DashMap<ExecutionHandle, AbortHandle>>,
    next_handle: AtomicU64,
}

impl TokioExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            bodies: DashMap::new(),
            capacity: None,
            running: Arc::new(DashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn with_capacity(mut self, capacity: Constraints) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn register<S, B>(&self, signature: S, body: B)
    where
        S: Into<String>,
        B: TaskBody + 'static,
    {
        let signature = signature.into();
        debug!(%signature, "Registered task body");
        self.bodies.insert(signature, Arc::new(body));
    }

    /// Number of bodies currently executing
    pub fn running(&self) -> usize {
        self.running.len()
    }

    fn select<'a>(&self, task: &'a DispatchedTask) -> Result<&'a Implementation> {
        let selected = match &self.capacity {
            Some(capacity) => task.core_element.select(capacity),
            None => task.core_element.implementations.first(),
        };
        selected.ok_or_else(|| {
            RuntimeError::invalid_task(format!(
                "no implementation of {} fits the executor capacity",
                task.signature()
            ))
        })
    }

    fn body_for(&self, task: &DispatchedTask) -> Result<Arc<dyn TaskBody>> {
        let implementation = self.select(task)?;
        [implementation.signature.as_str(), task.signature()]
            .iter()
            .find_map(|signature| self.bodies.get(*signature).map(|body| Arc::clone(body.value())))
            .ok_or_else(|| RuntimeError::UnknownCoreElement(task.signature().to_string()))
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, task: DispatchedTask, sink: CompletionSink) -> Result<ExecutionHandle> {
        let body = self.body_for(&task)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let task_id = task.id;
        let time_out = task.time_out;

        let execution = self.runtime.spawn(async move {
            match time_out {
                Some(limit) => match timeout(limit, body.run(&task)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {:?}", limit)),
                },
                None => body.run(&task).await,
            }
        });
        self.running.insert(handle, execution.abort_handle());

        let running = Arc::clone(&self.running);
        self.runtime.spawn(async move {
            let outcome = match execution.await {
                Ok(Ok(())) => TaskOutcome::Success,
                Ok(Err(e)) => {
                    warn!(task_id, error = %e, "Task body failed");
                    TaskOutcome::Failure(format!("{:#}", e))
                }
                Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
                Err(e) => TaskOutcome::Failure(format!("task body panicked: {}", e)),
            };
            running.remove(&handle);
            if let Err(e) = sink.complete(task_id, outcome) {
                error!(task_id, error = %e, "Completion rejected");
            }
        });

        info!(task_id, handle, "Task started");
        Ok(handle)
    }

    fn request_cancel(&self, handle: ExecutionHandle) {
        if let Some((_, execution)) = self.running.remove(&handle) {
            debug!(handle, "Aborting task body");
            execution.abort();
        }
    }
}
