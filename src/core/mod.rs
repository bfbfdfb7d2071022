// Core infrastructure shared by every component of the runtime

pub mod config;
pub mod errors;
pub mod events;
pub mod logging;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use errors::{Result, RuntimeError};
pub use events::{
    BufferingEventSink, Event, EventEmitter, EventSink, LoggingEventSink, RuntimeEvent,
};
pub use logging::init_tracing;
