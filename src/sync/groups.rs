use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{BarrierReport, Membership, TaskFailure};
use crate::core::errors::{Result, RuntimeError};
use crate::core::events::{EventEmitter, RuntimeEvent};
use crate::graph::{AppId, TaskId};

#[derive(Default)]
struct GroupInner {
    members: Vec<TaskId>,
    membership: Membership,
    failures: Vec<TaskFailure>,
    closed: bool,
}

/// A named, closable set of tasks
pub struct TaskGroup {
    name: String,
    app_id: AppId,
    implicit_barrier: bool,
    inner: Mutex<GroupInner>,
    changed: Condvar,
}

impl TaskGroup {
    fn new(app_id: AppId, name: &str, implicit_barrier: bool) -> Self {
        Self {
            name: name.to_string(),
            app_id,
            implicit_barrier,
            inner: Mutex::new(GroupInner::default()),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn implicit_barrier(&self) -> bool {
        self.implicit_barrier
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Members in submission order, with retried tasks resolved to their
    /// latest attempt
    pub fn members(&self) -> Vec<TaskId> {
        let inner = self.inner.lock();
        inner
            .members
            .iter()
            .map(|id| inner.membership.resolve(*id))
            .collect()
    }

    fn enroll(&self, task_id: TaskId) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.members.push(task_id);
        inner.membership.add(task_id);
        true
    }

    pub(crate) fn on_terminal(&self, task_id: TaskId, failure: Option<&str>) {
        {
            let mut inner = self.inner.lock();
            inner.membership.finish(task_id);
            if let Some(reason) = failure {
                inner.failures.push(TaskFailure {
                    task_id,
                    reason: reason.to_string(),
                });
            }
        }
        self.changed.notify_all();
    }

    pub(crate) fn replace(&self, old: TaskId, new: TaskId) {
        self.inner.lock().membership.replace(old, new);
    }

    fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        !std::mem::replace(&mut inner.closed, true)
    }

    /// Block until every member enrolled before the call is terminal
    fn wait(&self) -> BarrierReport {
        let mut inner = self.inner.lock();
        let snapshot = inner.members.clone();
        self.changed
            .wait_while(&mut inner, |inner| inner.membership.any_live(&snapshot));

        let resolved: Vec<TaskId> = snapshot
            .iter()
            .map(|id| inner.membership.resolve(*id))
            .collect();
        let failures = inner
            .failures
            .iter()
            .filter(|failure| resolved.contains(&failure.task_id))
            .cloned()
            .collect();
        BarrierReport {
            app_id: self.app_id,
            group: Some(self.name.clone()),
            waited: snapshot.len(),
            failures,
        }
    }
}

/// Named task groups per application
pub struct GroupManager {
    groups: DashMap<(AppId, String), Arc<TaskGroup>>,
    /// Groups currently accepting members, in opening order
    open: DashMap<AppId, Vec<Arc<TaskGroup>>>,
    events: Arc<EventEmitter>,
}

impl GroupManager {
    pub fn new(events: Arc<EventEmitter>) -> Self {
        Self {
            groups: DashMap::new(),
            open: DashMap::new(),
            events,
        }
    }

    /// Open a group. A closed group with the same name is replaced.
    pub fn open_group(&self, app_id: AppId, name: &str, implicit_barrier: bool) -> Result<Arc<TaskGroup>> {
        let group = Arc::new(TaskGroup::new(app_id, name, implicit_barrier));
        match self.groups.entry((app_id, name.to_string())) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_closed() {
                    return Err(RuntimeError::DuplicateGroup {
                        app_id,
                        name: name.to_string(),
                    });
                }
                existing.insert(Arc::clone(&group));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&group));
            }
        }
        self.open.entry(app_id).or_default().push(Arc::clone(&group));

        info!(app_id, group = name, implicit_barrier, "Opened task group");
        self.events.emit(RuntimeEvent::GroupOpened {
            app_id,
            name: name.to_string(),
        });
        Ok(group)
    }

    /// Add a task to every open group of its application
    pub fn enroll(&self, app_id: AppId, task_id: TaskId) -> Vec<Arc<TaskGroup>> {
        let open: Vec<Arc<TaskGroup>> = match self.open.get(&app_id) {
            Some(groups) => groups.value().clone(),
            None => return Vec::new(),
        };
        open.into_iter().filter(|group| group.enroll(task_id)).collect()
    }

    pub fn get(&self, app_id: AppId, name: &str) -> Result<Arc<TaskGroup>> {
        self.groups
            .get(&(app_id, name.to_string()))
            .map(|group| Arc::clone(group.value()))
            .ok_or_else(|| RuntimeError::UnknownGroup {
                app_id,
                name: name.to_string(),
            })
    }

    /// Close a group. With an implicit barrier this blocks until every
    /// member is terminal and returns the barrier report.
    pub fn close_group(&self, app_id: AppId, name: &str) -> Result<Option<BarrierReport>> {
        let group = self.get(app_id, name)?;
        if !group.close() {
            return Err(RuntimeError::UnknownGroup {
                app_id,
                name: name.to_string(),
            });
        }
        if let Some(mut open) = self.open.get_mut(&app_id) {
            open.retain(|candidate| !Arc::ptr_eq(candidate, &group));
        }

        let members = group.inner.lock().members.len();
        info!(app_id, group = name, members, "Closed task group");
        self.events.emit(RuntimeEvent::GroupClosed {
            app_id,
            name: name.to_string(),
            members,
        });

        if !group.implicit_barrier() {
            return Ok(None);
        }
        Ok(Some(self.wait(&group)))
    }

    /// Block until the group's current members are terminal
    pub fn barrier_group(&self, app_id: AppId, name: &str) -> Result<BarrierReport> {
        let group = self.get(app_id, name)?;
        Ok(self.wait(&group))
    }

    fn wait(&self, group: &TaskGroup) -> BarrierReport {
        debug!(app_id = group.app_id(), group = group.name(), "Group barrier waiting");
        let report = group.wait();
        self.events.emit(RuntimeEvent::BarrierReached {
            app_id: group.app_id(),
            group: Some(group.name().to_string()),
            failures: report.failures.len(),
        });
        report
    }

    /// Drop every group of an application
    pub fn remove_application(&self, app_id: AppId) {
        self.groups.retain(|(owner, _), _| *owner != app_id);
        self.open.remove(&app_id);
    }
}
