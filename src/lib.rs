//! Taskweave: a data-dependency task runtime
//!
//! Applications register core elements, then submit tasks whose parameters
//! name files and objects with a direction (IN, OUT, INOUT). The runtime
//! versions every datum, derives the dependency graph from the declared
//! accesses, and dispatches tasks to an executor once the versions they read
//! are written and the readers of the versions they overwrite are done.
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskweave::{
//!     Direction, ImplementationSpec, Parameter, RecordingExecutor, Runtime, TaskSpec,
//! };
//!
//! # fn main() -> taskweave::Result<()> {
//! let executor = Arc::new(RecordingExecutor::new());
//! let runtime = Runtime::builder().executor(executor.clone()).build()?;
//! runtime.register_core_element("produce", &[ImplementationSpec::method("produce")])?;
//! runtime.register_core_element("consume", &[ImplementationSpec::method("consume")])?;
//!
//! let a = runtime.submit_task(
//!     TaskSpec::new(1, "produce").with_parameter(Parameter::file(Direction::Out, "x")),
//! )?;
//! let b = runtime.submit_task(
//!     TaskSpec::new(1, "consume").with_parameter(Parameter::file(Direction::In, "x")),
//! )?;
//!
//! // Only the producer has been dispatched so far
//! assert_eq!(executor.submitted_ids(), vec![a]);
//! executor.succeed(a)?;
//! assert_eq!(executor.submitted_ids(), vec![b]);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod catalog;
pub mod core;
pub mod data;
pub mod executor;
pub mod graph;
pub mod runtime;
pub mod scheduler;
pub mod sync;

pub use access::{AccessManager, AccessMode, OpenedData};
pub use catalog::{Catalog, Constraints, CoreElement, ImplementationSpec, ImplementationType};
pub use crate::core::{init_tracing, Event, EventEmitter, Result, RuntimeConfig, RuntimeError, RuntimeEvent};
pub use data::{DataId, DataLocation, DataVersion, Direction, Producer, VersionState, VersionTracker};
pub use executor::{
    CompletionSink, DispatchedTask, ExecutionHandle, Executor, RecordingExecutor, TaskBody,
    TokioExecutor,
};
pub use graph::{
    AppId, OnFailure, Parameter, PlacementHints, TaskId, TaskOutcome, TaskSnapshot, TaskSpec,
    TaskStatus,
};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{Scheduler, SchedulerStats};
pub use sync::{BarrierReport, TaskFailure};
