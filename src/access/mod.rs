//! Main-program access to named data

pub mod manager;

pub use manager::{AccessManager, AccessMode, OpenedData};
