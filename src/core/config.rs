use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::{Result, RuntimeError};

/// Upper bound accepted for `max_retries`
pub const MAX_RETRY_LIMIT: u32 = 16;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for renamed file versions
    pub working_dir: PathBuf,
    /// Extra attempts granted to a task whose failure policy is RETRY
    pub max_retries: u32,
    /// Keep the in-memory event log
    pub record_events: bool,
    /// Mirror every event to tracing
    pub log_events: bool,
    /// Level used by `init_tracing`
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::temp_dir().join("taskweave"),
            max_retries: 2,
            record_events: true,
            log_events: false,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from YAML; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(RuntimeError::configuration("working_dir must not be empty"));
        }
        if self.max_retries > MAX_RETRY_LIMIT {
            return Err(RuntimeError::configuration(format!(
                "max_retries cannot exceed {}",
                MAX_RETRY_LIMIT
            )));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(RuntimeError::configuration(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_event_recording(mut self, enabled: bool) -> Self {
        self.record_events = enabled;
        self
    }

    pub fn with_event_logging(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    pub fn with_log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.log_level = level.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 2);
        assert!(config.record_events);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = RuntimeConfig::from_yaml_str("max_retries: 5\nlog_level: debug\n").unwrap();
        assert_eq!(
            config,
            RuntimeConfig::default()
                .with_max_retries(5)
                .with_log_level("debug")
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = RuntimeConfig::default().with_max_retries(MAX_RETRY_LIMIT + 1);
        assert!(matches!(config.validate(), Err(RuntimeError::Configuration(_))));

        let config = RuntimeConfig::default().with_log_level("loud");
        assert!(config.validate().is_err());

        let config = RuntimeConfig::default().with_working_dir("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "working_dir: /tmp/weave-test").unwrap();
        writeln!(file, "record_events: false").unwrap();

        let config = RuntimeConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/tmp/weave-test"));
        assert!(!config.record_events);
    }
}
