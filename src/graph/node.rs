use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::model::{AppId, BoundParameter, TaskId, TaskSpec, TaskStatus};
use crate::catalog::CoreElement;
use crate::executor::ExecutionHandle;
use crate::sync::TaskGroup;

/// Kind of ordering constraint between two tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    /// Read after write: the successor consumes the predecessor's output
    Flow,
    /// Write after read or write after write
    Anti,
}

/// Mutable part of a task, guarded by the node's own lock
#[derive(Debug)]
pub(crate) struct NodeState {
    pub status: TaskStatus,
    pub parameters: Vec<BoundParameter>,
    pub successors: Vec<(TaskId, EdgeKind)>,
    pub predecessors: Vec<(TaskId, EdgeKind)>,
    /// Reason a predecessor's failure makes this task unrunnable
    pub poisoned: Option<String>,
    /// A flow predecessor was already cancelled when the edge was requested
    pub cancel_on_arrival: bool,
    pub cancel_requested: bool,
    pub handle: Option<ExecutionHandle>,
    /// Retry attempt that took over this task's graph position
    pub superseded_by: Option<TaskId>,
    pub error: Option<String>,
}

impl NodeState {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            parameters: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            poisoned: None,
            cancel_on_arrival: false,
            cancel_requested: false,
            handle: None,
            superseded_by: None,
            error: None,
        }
    }
}

/// A task in the graph arena. Edges are stored as ids, never references
pub struct TaskNode {
    pub id: TaskId,
    pub spec: Arc<TaskSpec>,
    pub core_element: Arc<CoreElement>,
    pub attempt: u32,
    pub retry_of: Option<TaskId>,
    pub groups: Vec<Arc<TaskGroup>>,
    /// Unfinished predecessors, plus one while the submission is in progress
    pub(crate) in_degree: AtomicUsize,
    pub(crate) state: Mutex<NodeState>,
}

impl TaskNode {
    pub(crate) fn new(
        id: TaskId,
        spec: Arc<TaskSpec>,
        core_element: Arc<CoreElement>,
        groups: Vec<Arc<TaskGroup>>,
    ) -> Self {
        Self {
            id,
            spec,
            core_element,
            attempt: 0,
            retry_of: None,
            groups,
            in_degree: AtomicUsize::new(1),
            state: Mutex::new(NodeState::new(TaskStatus::Pending)),
        }
    }

    pub fn app_id(&self) -> AppId {
        self.spec.app_id
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn in_degree(&self) -> usize {
        self.in_degree.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        TaskSnapshot {
            id: self.id,
            app_id: self.spec.app_id,
            signature: self.spec.signature.clone(),
            priority: self.spec.priority,
            status: state.status,
            attempt: self.attempt,
            retry_of: self.retry_of,
            superseded_by: state.superseded_by,
            groups: self.groups.iter().map(|group| group.name().to_string()).collect(),
            predecessors: state.predecessors.iter().map(|(id, _)| *id).collect(),
            successors: state.successors.iter().map(|(id, _)| *id).collect(),
            parameters: state.parameters.clone(),
            cancel_requested: state.cancel_requested,
            error: state.error.clone(),
        }
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub app_id: AppId,
    pub signature: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempt: u32,
    pub retry_of: Option<TaskId>,
    pub superseded_by: Option<TaskId>,
    pub groups: Vec<String>,
    pub predecessors: Vec<TaskId>,
    /// Outstanding successor edges; emptied once they are released
    pub successors: Vec<TaskId>,
    pub parameters: Vec<BoundParameter>,
    pub cancel_requested: bool,
    pub error: Option<String>,
}

/// Append-only arena of task nodes indexed by id
pub struct TaskArena {
    nodes: DashMap<TaskId, Arc<TaskNode>>,
    next_id: AtomicU64,
}

impl TaskArena {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next task id; ids are unique and increasing
    pub fn allocate_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, node: Arc<TaskNode>) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<TaskNode>> {
        self.nodes.get(&id).map(|node| Arc::clone(node.value()))
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<TaskNode>> {
        self.nodes.remove(&id).map(|(_, node)| node)
    }

    /// All nodes ordered by id
    pub fn nodes(&self) -> Vec<Arc<TaskNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|node| Arc::clone(node.value())).collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}
