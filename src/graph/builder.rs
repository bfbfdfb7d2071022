use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::model::{BoundParameter, BoundVersion, TaskId, TaskSpec};
use super::node::{EdgeKind, TaskNode};
use crate::catalog::Catalog;
use crate::core::errors::{Result, RuntimeError};
use crate::core::events::{EventEmitter, RuntimeEvent};
use crate::data::{DataId, DeclaredAccess, Direction, Producer, VersionState, VersionTracker};
use crate::scheduler::Scheduler;
use crate::sync::{AppRegistry, GroupManager};

/// Ordering constraints collected while binding a task's parameters
#[derive(Debug, Default)]
struct Dependencies {
    tasks: BTreeMap<TaskId, EdgeKind>,
    main: Vec<(DataId, u64)>,
    poison: Option<String>,
}

impl Dependencies {
    fn on_task(&mut self, pred: TaskId, kind: EdgeKind) {
        let entry = self.tasks.entry(pred).or_insert(kind);
        if kind == EdgeKind::Flow {
            *entry = EdgeKind::Flow;
        }
    }

    fn on_producer(&mut self, producer: Producer, data: &DataId, version: u64, kind: EdgeKind) {
        match producer {
            Producer::Task(pred) => self.on_task(pred, kind),
            Producer::Main => {
                if !self.main.iter().any(|(d, v)| d == data && *v == version) {
                    self.main.push((data.clone(), version));
                }
            }
            Producer::External => {}
        }
    }
}

/// Turns submissions into graph nodes with counted predecessor sets
pub struct GraphBuilder {
    catalog: Arc<Catalog>,
    tracker: Arc<VersionTracker>,
    scheduler: Arc<Scheduler>,
    apps: Arc<AppRegistry>,
    groups: Arc<GroupManager>,
    events: Arc<EventEmitter>,
}

impl GraphBuilder {
    pub fn new(
        catalog: Arc<Catalog>,
        tracker: Arc<VersionTracker>,
        scheduler: Arc<Scheduler>,
        apps: Arc<AppRegistry>,
        groups: Arc<GroupManager>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            catalog,
            tracker,
            scheduler,
            apps,
            groups,
            events,
        }
    }

    /// Register a task. Its data accesses are declared in parameter order;
    /// the task becomes READY at once when nothing it depends on is
    /// unfinished, PENDING otherwise.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        spec.validate()?;
        let core_element = self.catalog.resolve(&spec.signature)?;

        let id = self.scheduler.allocate_id();
        self.apps.register(spec.app_id, id)?;
        let groups = self.groups.enroll(spec.app_id, id);
        let node = Arc::new(TaskNode::new(id, Arc::new(spec), core_element, groups));
        self.scheduler.insert(Arc::clone(&node));

        match self.bind(&node) {
            Ok(predecessors) => {
                info!(
                    task_id = id,
                    app_id = node.app_id(),
                    signature = %node.spec.signature,
                    predecessors,
                    "Task submitted"
                );
                self.events.emit(RuntimeEvent::TaskSubmitted {
                    task_id: id,
                    app_id: node.app_id(),
                    signature: node.spec.signature.clone(),
                    predecessors,
                });
                self.scheduler.seal(&node);
                Ok(id)
            }
            Err(e) => {
                self.scheduler.abandon(id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Declare every parameter and add the resulting edges. Returns the
    /// number of unfinished predecessors linked.
    fn bind(&self, node: &Arc<TaskNode>) -> Result<usize> {
        let producer = Producer::Task(node.id);
        let mut deps = Dependencies::default();
        let mut bound = Vec::with_capacity(node.spec.parameters.len());

        for parameter in &node.spec.parameters {
            let Some(data) = parameter.data_id() else {
                bound.push(BoundParameter {
                    parameter: parameter.clone(),
                    data: None,
                    read: None,
                    write: None,
                });
                continue;
            };

            let access = self.declare(&data, parameter.direction, producer, &mut deps)?;

            if let Some(read) = access.read {
                match read.state {
                    VersionState::Failed => {
                        deps.poison.get_or_insert(format!(
                            "{} version {} was never produced: {} failed",
                            data, read.number, read.producer
                        ));
                    }
                    // A written version may belong to a producer still on its
                    // way to FINISHED; linking a finished one is a no-op
                    _ if read.producer != producer => {
                        deps.on_producer(read.producer, &data, read.number, EdgeKind::Flow)
                    }
                    _ => {}
                }
            }
            if access.write.is_some() {
                // Writes wait for every reader of the version they supersede
                for reader in access.prior_readers.iter().filter(|reader| **reader != node.id) {
                    deps.on_task(*reader, EdgeKind::Anti);
                }
            }

            bound.push(BoundParameter {
                parameter: parameter.clone(),
                read: access
                    .read
                    .zip(access.read_location)
                    .map(|(version, location)| BoundVersion {
                        number: version.number,
                        location,
                    }),
                write: access
                    .write
                    .zip(access.write_location)
                    .map(|(number, location)| BoundVersion { number, location }),
                data: Some(data),
            });
        }

        node.state.lock().parameters = bound;
        deps.tasks.remove(&node.id);

        if let Some(reason) = deps.poison.take() {
            node.state.lock().poisoned.get_or_insert(reason);
        }
        let mut predecessors = 0;
        for (pred, kind) in &deps.tasks {
            if self.scheduler.link(*pred, node, *kind) {
                predecessors += 1;
            }
        }
        for (data, version) in &deps.main {
            if self.tracker.wait_on_main(data, *version, node.id, &node.in_degree)? {
                debug!(task_id = node.id, data = %data, version, "Waiting on main program write");
                predecessors += 1;
            }
        }
        Ok(predecessors)
    }

    /// Declare one access, turning write conflicts into anti-dependencies
    fn declare(
        &self,
        data: &DataId,
        direction: Direction,
        producer: Producer,
        deps: &mut Dependencies,
    ) -> Result<DeclaredAccess> {
        let mut acknowledged = Vec::new();
        loop {
            match self.tracker.declare_access(data, direction, producer, &acknowledged) {
                Ok(access) => return Ok(access),
                Err(RuntimeError::ConcurrentWriteConflict {
                    version,
                    producer: holder,
                    ..
                }) => {
                    debug!(data = %data, version, %holder, "Write conflict resolved into edge");
                    deps.on_producer(holder, data, version, EdgeKind::Anti);
                    acknowledged.push(holder);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
