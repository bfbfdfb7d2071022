use super::errors::{Result, RuntimeError};

/// Install a fmt subscriber writing to stderr at `level`.
///
/// Fails with a configuration error when the level is unknown or a global
/// subscriber is already installed.
pub fn init_tracing(level: &str) -> Result<()> {
    let level: tracing::Level = level
        .parse()
        .map_err(|_| RuntimeError::configuration(format!("unknown log level '{}'", level)))?;

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| RuntimeError::configuration(format!("tracing already initialised: {}", e)))
}
