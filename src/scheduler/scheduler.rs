use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use petgraph::dot::Dot;
use petgraph::graph::DiGraph;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::ready_queue::ReadyQueue;
use crate::core::errors::{Result, RuntimeError};
use crate::core::events::{EventEmitter, RuntimeEvent};
use crate::data::VersionTracker;
use crate::executor::{DispatchedTask, ExecutionHandle};
use crate::graph::node::NodeState;
use crate::graph::{
    AppId, BoundParameter, EdgeKind, OnFailure, TaskArena, TaskId, TaskNode, TaskOutcome,
    TaskSnapshot, TaskStatus,
};
use crate::sync::AppRegistry;

/// A pending unit of in-degree release, with the poison it carries
type Release = (TaskId, Option<String>);

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    ignored: AtomicU64,
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub ignored: u64,
    pub ready: usize,
    pub tracked: usize,
}

/// Owner of every task node; moves tasks through
/// PENDING -> READY -> RUNNING -> FINISHED | FAILED | CANCELLED.
///
/// Each node is guarded by its own lock and no two node locks are ever held
/// at once. A node lock may be held while calling into the version tracker,
/// never the other way round.
pub struct Scheduler {
    arena: TaskArena,
    ready: ReadyQueue,
    tracker: Arc<VersionTracker>,
    apps: Arc<AppRegistry>,
    events: Arc<EventEmitter>,
    max_retries: u32,
    counters: Counters,
}

impl Scheduler {
    pub fn new(
        tracker: Arc<VersionTracker>,
        apps: Arc<AppRegistry>,
        events: Arc<EventEmitter>,
        max_retries: u32,
    ) -> Self {
        Self {
            arena: TaskArena::new(),
            ready: ReadyQueue::new(),
            tracker,
            apps,
            events,
            max_retries,
            counters: Counters::default(),
        }
    }

    pub(crate) fn allocate_id(&self) -> TaskId {
        self.arena.allocate_id()
    }

    pub(crate) fn insert(&self, node: Arc<TaskNode>) {
        self.arena.insert(node);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn node(&self, id: TaskId) -> Result<Arc<TaskNode>> {
        self.arena.get(id).ok_or(RuntimeError::UnknownTask(id))
    }

    /// Add the edge `pred -> succ`, unless `pred` is already resolved.
    /// Returns whether an edge was added.
    ///
    /// A retried predecessor is followed to its latest attempt; a node that
    /// was released from the arena counts as finished.
    pub(crate) fn link(&self, pred: TaskId, succ: &TaskNode, kind: EdgeKind) -> bool {
        let mut current = pred;
        loop {
            let Some(node) = self.arena.get(current) else {
                return false;
            };
            let mut state = node.state.lock();
            match state.status {
                TaskStatus::Finished => return false,
                TaskStatus::Failed => {
                    if let Some(next) = state.superseded_by {
                        current = next;
                        continue;
                    }
                    drop(state);
                    if kind == EdgeKind::Flow {
                        if node.spec.on_failure == OnFailure::CancelSuccessor {
                            succ.state.lock().cancel_on_arrival = true;
                        } else {
                            let reason = format!("producer task {} failed", current);
                            succ.state.lock().poisoned.get_or_insert(reason);
                        }
                    }
                    return false;
                }
                TaskStatus::Cancelled => {
                    drop(state);
                    if kind == EdgeKind::Flow {
                        succ.state.lock().cancel_on_arrival = true;
                    }
                    return false;
                }
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running => {
                    state.successors.push((succ.id, kind));
                    succ.in_degree.fetch_add(1, Ordering::AcqRel);
                    drop(state);
                    succ.state.lock().predecessors.push((current, kind));
                    debug!(pred = current, succ = succ.id, ?kind, "Added edge");
                    return true;
                }
            }
        }
    }

    /// Drop one unit of in-degree; the task is promoted when it reaches zero.
    /// Submission holds one unit until every parameter is bound.
    pub(crate) fn release(&self, id: TaskId, poison: Option<String>) {
        self.release_all(vec![(id, poison)]);
    }

    /// Drain a work list of releases. A promotion that resolves its task
    /// without running it pushes the task's successors onto the same list,
    /// depth first and in edge order.
    fn release_all(&self, mut work: Vec<Release>) {
        while let Some((id, poison)) = work.pop() {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            if let Some(reason) = poison {
                node.state.lock().poisoned.get_or_insert(reason);
            }
            let previous = node.in_degree.fetch_sub(1, Ordering::AcqRel);
            if previous == 0 {
                error!(task_id = id, "In-degree underflow");
                panic!("invariant violation: in-degree underflow on task {}", id);
            }
            if previous == 1 {
                self.promote(&node, &mut work);
            }
        }
    }

    /// End of submission: release the submission's unit of in-degree. A task
    /// cancelled while its parameters were still being bound drops the
    /// versions it registered afterwards.
    pub(crate) fn seal(&self, node: &Arc<TaskNode>) {
        {
            let state = node.state.lock();
            if state.status == TaskStatus::Cancelled {
                self.cancel_writes(node.id, &state.parameters);
            }
        }
        self.release(node.id, None);
    }

    fn promote(&self, node: &Arc<TaskNode>, work: &mut Vec<Release>) {
        let mut state = node.state.lock();
        if state.status != TaskStatus::Pending {
            return;
        }
        if state.cancel_on_arrival {
            drop(state);
            self.cancel_transitive(vec![node.id]);
            return;
        }
        if let Some(reason) = state.poisoned.clone() {
            // Never runs; resolved under its own failure policy
            let policy = match node.spec.on_failure {
                OnFailure::Retry => OnFailure::Fail,
                other => other,
            };
            warn!(task_id = node.id, %reason, "Task cannot run");
            self.apply_failure(node, state, reason, policy, work);
            return;
        }
        state.status = TaskStatus::Ready;
        drop(state);

        self.ready.push(node.id, node.spec.priority);
        debug!(task_id = node.id, "Task ready");
        self.events.emit(RuntimeEvent::TaskReady { task_id: node.id });
    }

    /// Pull ready tasks in priority order, ties broken by submission order.
    /// Never blocks; an exhausted iterator only means nothing is ready now.
    pub fn dispatch(&self) -> Dispatch<'_> {
        Dispatch { scheduler: self }
    }

    fn start(&self, id: TaskId) -> Option<DispatchedTask> {
        let node = self.arena.get(id)?;
        let mut state = node.state.lock();
        if state.status != TaskStatus::Ready {
            return None;
        }
        state.status = TaskStatus::Running;
        let parameters = state
            .parameters
            .iter()
            .map(|parameter| self.resolve_locations(parameter))
            .collect();
        drop(state);

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        info!(task_id = id, signature = %node.spec.signature, attempt = node.attempt, "Dispatching task");
        self.events.emit(RuntimeEvent::TaskRunning {
            task_id: id,
            attempt: node.attempt,
        });

        Some(DispatchedTask {
            id,
            app_id: node.spec.app_id,
            attempt: node.attempt,
            core_element: Arc::clone(&node.core_element),
            priority: node.spec.priority,
            time_out: node.spec.time_out,
            on_failure: node.spec.on_failure,
            has_target: node.spec.has_target,
            num_returns: node.spec.num_returns,
            parameters,
            hints: node.spec.hints,
        })
    }

    fn resolve_locations(&self, parameter: &BoundParameter) -> BoundParameter {
        let mut resolved = parameter.clone();
        if let (Some(data), Some(read)) = (&parameter.data, resolved.read.as_mut()) {
            if let Some(location) = self.tracker.location(data, read.number) {
                read.location = location;
            }
        }
        resolved
    }

    /// Record the executor's handle. Returns true if cancellation was already
    /// requested for the task.
    pub fn attach_handle(&self, id: TaskId, handle: ExecutionHandle) -> bool {
        let Some(node) = self.arena.get(id) else {
            return false;
        };
        let mut state = node.state.lock();
        if state.status != TaskStatus::Running {
            return false;
        }
        state.handle = Some(handle);
        state.cancel_requested
    }

    pub fn handle(&self, id: TaskId) -> Option<ExecutionHandle> {
        self.arena.get(id).and_then(|node| node.state.lock().handle)
    }

    /// Executor callback. Returns running tasks whose cancellation must be
    /// requested from the executor as a consequence.
    pub fn on_completion(&self, id: TaskId, outcome: TaskOutcome) -> Result<Vec<TaskId>> {
        let node = self.node(id)?;
        let state = node.state.lock();
        if state.status != TaskStatus::Running {
            let err = RuntimeError::invariant(format!(
                "completion of task {} reported while {}",
                id, state.status
            ));
            error!(task_id = id, error = %err, "Rejected completion");
            return Err(err);
        }

        match outcome {
            TaskOutcome::Success => {
                self.finish(&node, state);
                Ok(Vec::new())
            }
            TaskOutcome::Cancelled => Ok(self.cancel_running(&node, state)),
            TaskOutcome::Failure(reason) if state.cancel_requested => {
                // Stopped on request; a failure on the way out is not retried
                info!(task_id = id, %reason, "Cancelled task reported failure");
                Ok(self.cancel_running(&node, state))
            }
            TaskOutcome::Failure(reason) => {
                warn!(task_id = id, attempt = node.attempt, %reason, "Task failed");
                let policy = node.spec.on_failure;
                if policy == OnFailure::Retry && node.attempt < self.max_retries {
                    self.retry(&node, state, reason);
                    return Ok(Vec::new());
                }
                let policy = if policy == OnFailure::Retry {
                    OnFailure::Fail
                } else {
                    policy
                };
                let mut work = Vec::new();
                let running = self.apply_failure(&node, state, reason, policy, &mut work);
                self.release_all(work);
                Ok(running)
            }
        }
    }

    fn finish(&self, node: &Arc<TaskNode>, mut state: MutexGuard<'_, NodeState>) {
        // Outputs are committed before the task is observed as finished
        for parameter in &state.parameters {
            if let (Some(data), Some(write)) = (&parameter.data, &parameter.write) {
                if let Err(e) = self.tracker.complete(data, write.number, true) {
                    error!(task_id = node.id, data = %data, error = %e, "Failed to commit version");
                }
            }
        }
        state.status = TaskStatus::Finished;
        let successors = std::mem::take(&mut state.successors);
        drop(state);

        self.counters.finished.fetch_add(1, Ordering::Relaxed);
        info!(task_id = node.id, successors = successors.len(), "Task finished");
        self.events.emit(RuntimeEvent::TaskFinished { task_id: node.id });
        self.release_all(successors.into_iter().rev().map(|(id, _)| (id, None)).collect());
        self.notify_terminal(node, None);
    }

    fn retry(&self, node: &Arc<TaskNode>, mut state: MutexGuard<'_, NodeState>, reason: String) {
        let retry_id = self.arena.allocate_id();
        let mut retry_state = NodeState::new(TaskStatus::Ready);
        retry_state.parameters = state.parameters.clone();
        retry_state.predecessors = state.predecessors.clone();
        retry_state.successors = std::mem::take(&mut state.successors);
        let retry = Arc::new(TaskNode {
            id: retry_id,
            spec: Arc::clone(&node.spec),
            core_element: Arc::clone(&node.core_element),
            attempt: node.attempt + 1,
            retry_of: Some(node.id),
            groups: node.groups.clone(),
            in_degree: AtomicUsize::new(0),
            state: Mutex::new(retry_state),
        });
        self.arena.insert(Arc::clone(&retry));

        state.status = TaskStatus::Failed;
        state.error = Some(reason);
        state.superseded_by = Some(retry_id);
        let parameters = state.parameters.clone();
        drop(state);

        for parameter in &parameters {
            if let (Some(data), Some(write)) = (&parameter.data, &parameter.write) {
                if let Err(e) = self.tracker.reassign_producer(data, write.number, node.id, retry_id) {
                    error!(task_id = node.id, data = %data, error = %e, "Failed to hand over version");
                }
            }
        }
        self.apps.replace(node.app_id(), node.id, retry_id);
        for group in &node.groups {
            group.replace(node.id, retry_id);
        }

        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        warn!(task_id = node.id, retry_id, attempt = retry.attempt, "Retrying task");
        self.events.emit(RuntimeEvent::TaskRetried {
            task_id: node.id,
            retry_id,
            attempt: retry.attempt,
        });
        self.ready.push(retry_id, retry.spec.priority);
        self.events.emit(RuntimeEvent::TaskReady { task_id: retry_id });
    }

    /// Resolve a failed task (run or not) under `policy`. Successors to
    /// release are pushed onto `work` for the caller to drain. Returns
    /// running tasks that need a cancellation request.
    fn apply_failure(
        &self,
        node: &Arc<TaskNode>,
        mut state: MutexGuard<'_, NodeState>,
        reason: String,
        policy: OnFailure,
        work: &mut Vec<Release>,
    ) -> Vec<TaskId> {
        let writes: Vec<_> = state
            .parameters
            .iter()
            .filter_map(|p| Some((p.data.clone()?, p.write.as_ref()?.number)))
            .collect();

        match policy {
            OnFailure::Ignore => {
                for (data, number) in &writes {
                    if let Err(e) = self.tracker.resolve_ignored(data, *number) {
                        error!(task_id = node.id, data = %data, error = %e, "Failed to resolve ignored version");
                    }
                }
                state.status = TaskStatus::Finished;
                state.error = Some(reason.clone());
                let successors = std::mem::take(&mut state.successors);
                drop(state);

                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                info!(task_id = node.id, "Task failure ignored");
                self.events.emit(RuntimeEvent::FailureIgnored {
                    task_id: node.id,
                    reason,
                });
                self.notify_terminal(node, None);
                work.extend(successors.into_iter().rev().map(|(id, _)| (id, None)));
                Vec::new()
            }
            OnFailure::CancelSuccessor => {
                self.cancel_writes(node.id, &state.parameters);
                let successors = self.mark_failed(node, state, &reason);
                self.notify_terminal(node, Some(&reason));
                self.cancel_transitive(successors.into_iter().map(|(id, _)| id).collect())
            }
            OnFailure::Fail | OnFailure::Retry => {
                for (data, number) in &writes {
                    if let Err(e) = self.tracker.complete(data, *number, false) {
                        error!(task_id = node.id, data = %data, error = %e, "Failed to mark version failed");
                    }
                }
                let successors = self.mark_failed(node, state, &reason);
                // Reported before the dependents it fails
                self.notify_terminal(node, Some(&reason));
                work.extend(successors.into_iter().rev().map(|(id, kind)| {
                    let poison = (kind == EdgeKind::Flow)
                        .then(|| format!("producer task {} failed: {}", node.id, reason));
                    (id, poison)
                }));
                Vec::new()
            }
        }
    }

    fn mark_failed(
        &self,
        node: &TaskNode,
        mut state: MutexGuard<'_, NodeState>,
        reason: &str,
    ) -> Vec<(TaskId, EdgeKind)> {
        state.status = TaskStatus::Failed;
        state.error = Some(reason.to_string());
        let successors = std::mem::take(&mut state.successors);
        drop(state);

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(RuntimeEvent::TaskFailed {
            task_id: node.id,
            reason: reason.to_string(),
        });
        successors
    }

    fn cancel_running(&self, node: &Arc<TaskNode>, mut state: MutexGuard<'_, NodeState>) -> Vec<TaskId> {
        self.cancel_writes(node.id, &state.parameters);
        state.status = TaskStatus::Cancelled;
        let successors = std::mem::take(&mut state.successors);
        drop(state);

        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        info!(task_id = node.id, "Running task cancelled");
        self.events.emit(RuntimeEvent::TaskCancelled { task_id: node.id });
        self.notify_terminal(node, None);
        self.cancel_transitive(successors.into_iter().map(|(id, _)| id).collect())
    }

    /// Cancel `roots` and everything downstream of them. Pending and ready
    /// tasks are cancelled at once; running ones are flagged and returned so
    /// the caller can ask the executor to stop them.
    pub fn cancel_transitive(&self, roots: Vec<TaskId>) -> Vec<TaskId> {
        let mut work = roots;
        let mut seen = HashSet::new();
        let mut running = Vec::new();

        while let Some(id) = work.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            let mut state = node.state.lock();
            match state.status {
                TaskStatus::Pending | TaskStatus::Ready => {
                    self.cancel_writes(id, &state.parameters);
                    state.status = TaskStatus::Cancelled;
                    work.extend(std::mem::take(&mut state.successors).into_iter().map(|(s, _)| s));
                    drop(state);

                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    info!(task_id = id, "Task cancelled");
                    self.events.emit(RuntimeEvent::TaskCancelled { task_id: id });
                    self.notify_terminal(&node, None);
                }
                TaskStatus::Running => {
                    if !state.cancel_requested {
                        state.cancel_requested = true;
                        running.push(id);
                    }
                }
                TaskStatus::Failed => {
                    if let Some(next) = state.superseded_by {
                        work.push(next);
                    }
                }
                TaskStatus::Finished | TaskStatus::Cancelled => {}
            }
        }
        running
    }

    /// Cancel every live task of an application
    pub fn cancel_application(&self, app_id: AppId) -> Vec<TaskId> {
        let live = self.apps.live_tasks(app_id);
        info!(app_id, tasks = live.len(), "Cancelling application tasks");
        self.cancel_transitive(live)
    }

    /// Drop the still pending versions a task was going to write
    fn cancel_writes(&self, id: TaskId, parameters: &[BoundParameter]) {
        for parameter in parameters {
            if let (Some(data), Some(write)) = (&parameter.data, &parameter.write) {
                if let Err(e) = self.tracker.cancel_version(data, write.number) {
                    error!(task_id = id, data = %data, error = %e, "Failed to cancel version");
                }
            }
        }
    }

    fn notify_terminal(&self, node: &TaskNode, failure: Option<&str>) {
        self.apps.on_terminal(node.app_id(), node.id, failure);
        for group in &node.groups {
            group.on_terminal(node.id, failure);
        }
    }

    /// Fail a task whose submission could not be completed
    pub(crate) fn abandon(&self, id: TaskId, reason: &str) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        let state = node.state.lock();
        if state.status != TaskStatus::Pending {
            return;
        }
        warn!(task_id = id, %reason, "Abandoning submission");
        let mut work = Vec::new();
        self.apply_failure(&node, state, reason.to_string(), OnFailure::CancelSuccessor, &mut work);
        self.release_all(work);
    }

    pub fn task(&self, id: TaskId) -> Result<TaskSnapshot> {
        Ok(self.node(id)?.snapshot())
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus> {
        Ok(self.node(id)?.status())
    }

    /// Follow retries from `id` to the attempt currently holding its place
    pub fn latest_attempt(&self, id: TaskId) -> TaskId {
        let mut current = id;
        while let Some(next) = self
            .arena
            .get(current)
            .and_then(|node| node.state.lock().superseded_by)
        {
            current = next;
        }
        current
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            finished: self.counters.finished.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            ready: self.ready.len(),
            tracked: self.arena.len(),
        }
    }

    /// Graphviz rendering of the tracked task graph
    pub fn to_dot(&self) -> String {
        let nodes = self.arena.nodes();
        let mut graph = DiGraph::<String, &'static str>::new();
        let mut index = HashMap::new();
        for node in &nodes {
            let label = format!("{} {} [{}]", node.id, node.spec.signature, node.status());
            index.insert(node.id, graph.add_node(label));
        }
        for node in &nodes {
            let predecessors = node.state.lock().predecessors.clone();
            for (pred, kind) in predecessors {
                if let (Some(from), Some(to)) = (index.get(&pred), index.get(&node.id)) {
                    let label = match kind {
                        EdgeKind::Flow => "flow",
                        EdgeKind::Anti => "anti",
                    };
                    graph.add_edge(*from, *to, label);
                }
            }
        }
        format!("{}", Dot::new(&graph))
    }

    /// Drop the nodes of an application whose tasks are all terminal.
    /// Returns how many nodes were released.
    pub fn release_application(&self, app_id: AppId) -> usize {
        if !self.apps.live_tasks(app_id).is_empty() {
            return 0;
        }
        let mut released = 0;
        for node in self.arena.nodes() {
            if node.app_id() == app_id && node.status().is_terminal() {
                self.arena.remove(node.id);
                released += 1;
            }
        }
        self.apps.remove(app_id);
        debug!(app_id, released, "Released application tasks");
        released
    }
}

/// Lazy sequence of dispatchable tasks
pub struct Dispatch<'a> {
    scheduler: &'a Scheduler,
}

impl Iterator for Dispatch<'_> {
    type Item = DispatchedTask;

    fn next(&mut self) -> Option<DispatchedTask> {
        loop {
            let id = self.scheduler.ready.pop()?;
            if let Some(task) = self.scheduler.start(id) {
                return Some(task);
            }
        }
    }
}
