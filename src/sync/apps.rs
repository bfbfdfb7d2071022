use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{BarrierReport, Membership, TaskFailure};
use crate::core::errors::{Result, RuntimeError};
use crate::graph::{AppId, TaskId};

#[derive(Default)]
struct AppInner {
    membership: Membership,
    /// Failures not yet reported by a barrier
    failures: Vec<TaskFailure>,
    sealed: bool,
    submitted: usize,
}

#[derive(Default)]
struct AppState {
    inner: Mutex<AppInner>,
    changed: Condvar,
}

/// Per-application task bookkeeping used by `barrier`
#[derive(Default)]
pub struct AppRegistry {
    apps: DashMap<AppId, Arc<AppState>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, app_id: AppId) -> Arc<AppState> {
        if let Some(state) = self.apps.get(&app_id) {
            return Arc::clone(state.value());
        }
        Arc::clone(self.apps.entry(app_id).or_default().value())
    }

    fn existing(&self, app_id: AppId) -> Option<Arc<AppState>> {
        self.apps.get(&app_id).map(|state| Arc::clone(state.value()))
    }

    /// Record a newly submitted task
    pub fn register(&self, app_id: AppId, task_id: TaskId) -> Result<()> {
        let state = self.state(app_id);
        let mut inner = state.inner.lock();
        if inner.sealed {
            return Err(RuntimeError::ApplicationSealed(app_id));
        }
        inner.membership.add(task_id);
        inner.submitted += 1;
        Ok(())
    }

    pub fn on_terminal(&self, app_id: AppId, task_id: TaskId, failure: Option<&str>) {
        let Some(state) = self.existing(app_id) else {
            return;
        };
        {
            let mut inner = state.inner.lock();
            inner.membership.finish(task_id);
            if let Some(reason) = failure {
                inner.failures.push(TaskFailure {
                    task_id,
                    reason: reason.to_string(),
                });
            }
        }
        state.changed.notify_all();
    }

    /// A retry attempt takes over the place of `old`
    pub fn replace(&self, app_id: AppId, old: TaskId, new: TaskId) {
        if let Some(state) = self.existing(app_id) {
            state.inner.lock().membership.replace(old, new);
        }
    }

    /// No more tasks will be submitted under `app_id`
    pub fn seal(&self, app_id: AppId) {
        let state = self.state(app_id);
        state.inner.lock().sealed = true;
        info!(app_id, "Application sealed");
    }

    pub fn is_sealed(&self, app_id: AppId) -> bool {
        self.existing(app_id)
            .map(|state| state.inner.lock().sealed)
            .unwrap_or(false)
    }

    /// Tasks of the application that are not terminal yet
    pub fn live_tasks(&self, app_id: AppId) -> Vec<TaskId> {
        self.existing(app_id)
            .map(|state| state.inner.lock().membership.live())
            .unwrap_or_default()
    }

    pub fn submitted(&self, app_id: AppId) -> usize {
        self.existing(app_id)
            .map(|state| state.inner.lock().submitted)
            .unwrap_or(0)
    }

    /// Block until every task submitted under `app_id` before the call is
    /// terminal. The report drains the failures recorded since the last
    /// barrier of the application.
    pub fn barrier(&self, app_id: AppId) -> BarrierReport {
        let Some(state) = self.existing(app_id) else {
            return BarrierReport {
                app_id,
                group: None,
                waited: 0,
                failures: Vec::new(),
            };
        };
        let mut inner = state.inner.lock();
        let snapshot = inner.membership.live();
        debug!(app_id, tasks = snapshot.len(), "Barrier waiting");
        state
            .changed
            .wait_while(&mut inner, |inner| inner.membership.any_live(&snapshot));

        BarrierReport {
            app_id,
            group: None,
            waited: snapshot.len(),
            failures: std::mem::take(&mut inner.failures),
        }
    }

    /// Forget an application with no live tasks. Returns false if it still
    /// has tasks in flight.
    pub fn remove(&self, app_id: AppId) -> bool {
        self.apps
            .remove_if(&app_id, |_, state| state.inner.lock().membership.is_empty())
            .is_some()
    }
}
