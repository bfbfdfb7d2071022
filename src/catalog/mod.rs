//! Registration catalog of core elements and their implementations

pub mod constraints;
pub mod registry;

pub use constraints::Constraints;
pub use registry::{Catalog, CoreElement, Implementation, ImplementationSpec, ImplementationType};
