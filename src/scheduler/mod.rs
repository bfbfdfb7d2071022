//! Ready set management, dispatch and completion handling

pub mod ready_queue;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use ready_queue::ReadyQueue;
pub use scheduler::{Dispatch, Scheduler, SchedulerStats};
