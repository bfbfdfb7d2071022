//! Task model and dependency graph construction

pub mod builder;
pub mod model;
pub mod node;

pub use builder::GraphBuilder;
pub use model::{
    AppId, BoundParameter, BoundVersion, OnFailure, Parameter, ParameterKind, PlacementHints,
    TaskId, TaskOutcome, TaskSpec, TaskStatus,
};
pub use node::{EdgeKind, TaskArena, TaskNode, TaskSnapshot};
