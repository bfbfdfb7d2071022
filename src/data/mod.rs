//! Named data and their versions

pub mod model;
pub mod tracker;

pub use model::{
    renaming, DataId, DataKind, DataLocation, DataVersion, DeclaredAccess, Direction, Producer,
    VersionRef, VersionState,
};
pub use tracker::VersionTracker;
