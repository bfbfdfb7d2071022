//! Barriers and task groups
//!
//! Both track a set of live task ids and block waiters on a condition
//! variable until the ids they snapshot reach a terminal state. A retried
//! task is tracked through an alias from the failed attempt to its
//! replacement, so waiters never observe the superseded attempt.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::graph::{AppId, TaskId};

pub mod apps;
pub mod groups;

pub use apps::AppRegistry;
pub use groups::{GroupManager, TaskGroup};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub reason: String,
}

/// Result of a barrier: how many tasks were awaited and which of them failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierReport {
    pub app_id: AppId,
    pub group: Option<String>,
    pub waited: usize,
    pub failures: Vec<TaskFailure>,
}

impl BarrierReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aggregated failure description, `None` when every task succeeded
    pub fn exception_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let scope = match &self.group {
            Some(group) => format!("group '{}' of application {}", group, self.app_id),
            None => format!("application {}", self.app_id),
        };
        let details: Vec<String> = self
            .failures
            .iter()
            .map(|failure| format!("task {}: {}", failure.task_id, failure.reason))
            .collect();
        Some(format!(
            "{} task(s) failed in {}: {}",
            self.failures.len(),
            scope,
            details.join("; ")
        ))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Membership {
    live: HashSet<TaskId>,
    aliases: HashMap<TaskId, TaskId>,
}

impl Membership {
    pub fn add(&mut self, id: TaskId) {
        self.live.insert(id);
    }

    pub fn resolve(&self, mut id: TaskId) -> TaskId {
        while let Some(next) = self.aliases.get(&id) {
            id = *next;
        }
        id
    }

    pub fn replace(&mut self, old: TaskId, new: TaskId) {
        if self.live.remove(&old) {
            self.live.insert(new);
        }
        self.aliases.insert(old, new);
    }

    pub fn finish(&mut self, id: TaskId) -> bool {
        self.live.remove(&id)
    }

    pub fn any_live(&self, ids: &[TaskId]) -> bool {
        ids.iter().any(|id| self.live.contains(&self.resolve(*id)))
    }

    pub fn live(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.live.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_follows_retries() {
        let mut membership = Membership::default();
        membership.add(1);
        membership.add(2);
        membership.replace(1, 5);
        membership.replace(5, 9);

        assert_eq!(membership.resolve(1), 9);
        assert!(membership.any_live(&[1]));
        assert!(membership.finish(9));
        assert!(!membership.any_live(&[1]));
        assert_eq!(membership.live(), vec![2]);
    }

    #[test]
    fn test_exception_message() {
        let report = BarrierReport {
            app_id: 3,
            group: Some("g1".to_string()),
            waited: 2,
            failures: vec![TaskFailure {
                task_id: 7,
                reason: "exit code 1".to_string(),
            }],
        };
        assert!(!report.is_success());
        assert_eq!(
            report.exception_message().unwrap(),
            "1 task(s) failed in group 'g1' of application 3: task 7: exit code 1"
        );
    }
}
