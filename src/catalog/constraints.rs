//! Resource constraints attached to implementations.
//!
//! Constraints arrive as `Key:Value` pairs separated by `;`, for example
//! `ComputingUnits:4;MemorySize:2.5;StorageType:SSD`. Keys are matched
//! case-insensitively; unknown keys are preserved in `extra`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RuntimeError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub computing_units: u32,
    /// GHz
    pub processor_speed: Option<f64>,
    pub processor_architecture: Option<String>,
    /// GB
    pub memory_size: Option<f64>,
    pub memory_type: Option<String>,
    /// GB
    pub storage_size: Option<f64>,
    pub storage_type: Option<String>,
    pub operating_system_type: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            computing_units: 1,
            processor_speed: None,
            processor_architecture: None,
            memory_size: None,
            memory_type: None,
            storage_size: None,
            storage_type: None,
            operating_system_type: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Constraints {
    /// Parse a constraint string; `implementation` names the owner in errors
    pub fn parse(implementation: &str, text: &str) -> Result<Self> {
        let mut constraints = Self::default();

        for pair in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                RuntimeError::invalid_constraint(implementation, format!("'{}' is not Key:Value", pair))
            })?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return Err(RuntimeError::invalid_constraint(
                    implementation,
                    format!("'{}' has an empty key or value", pair),
                ));
            }

            match key.to_ascii_lowercase().as_str() {
                "computingunits" => {
                    let units: u32 = value.parse().map_err(|_| {
                        RuntimeError::invalid_constraint(
                            implementation,
                            format!("ComputingUnits '{}' is not a positive integer", value),
                        )
                    })?;
                    if units == 0 {
                        return Err(RuntimeError::invalid_constraint(
                            implementation,
                            "ComputingUnits must be at least 1",
                        ));
                    }
                    constraints.computing_units = units;
                }
                "processorspeed" => {
                    constraints.processor_speed = Some(parse_amount(implementation, key, value)?)
                }
                "memorysize" => constraints.memory_size = Some(parse_amount(implementation, key, value)?),
                "storagesize" => constraints.storage_size = Some(parse_amount(implementation, key, value)?),
                "processorarchitecture" => constraints.processor_architecture = Some(value.to_string()),
                "memorytype" => constraints.memory_type = Some(value.to_string()),
                "storagetype" => constraints.storage_type = Some(value.to_string()),
                "operatingsystemtype" => constraints.operating_system_type = Some(value.to_string()),
                _ => {
                    constraints.extra.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(constraints)
    }

    /// Whether a resource offering `available` can host this implementation.
    /// Properties the resource leaves unspecified do not restrict placement.
    pub fn fits(&self, available: &Constraints) -> bool {
        self.computing_units <= available.computing_units
            && amount_fits(self.processor_speed, available.processor_speed)
            && amount_fits(self.memory_size, available.memory_size)
            && amount_fits(self.storage_size, available.storage_size)
            && label_fits(&self.processor_architecture, &available.processor_architecture)
            && label_fits(&self.memory_type, &available.memory_type)
            && label_fits(&self.storage_type, &available.storage_type)
            && label_fits(&self.operating_system_type, &available.operating_system_type)
    }
}

fn parse_amount(implementation: &str, key: &str, value: &str) -> Result<f64> {
    match value.parse::<f64>() {
        Ok(amount) if amount.is_finite() && amount >= 0.0 => Ok(amount),
        _ => Err(RuntimeError::invalid_constraint(
            implementation,
            format!("{} '{}' is not a non-negative number", key, value),
        )),
    }
}

fn amount_fits(required: Option<f64>, available: Option<f64>) -> bool {
    match (required, available) {
        (Some(required), Some(available)) => required <= available,
        _ => true,
    }
}

fn label_fits(required: &Option<String>, available: &Option<String>) -> bool {
    match (required, available) {
        (Some(required), Some(available)) => required.eq_ignore_ascii_case(available),
        _ => true,
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputingUnits:{}", self.computing_units)?;
        if let Some(speed) = self.processor_speed {
            write!(f, ";ProcessorSpeed:{}", speed)?;
        }
        if let Some(arch) = &self.processor_architecture {
            write!(f, ";ProcessorArchitecture:{}", arch)?;
        }
        if let Some(size) = self.memory_size {
            write!(f, ";MemorySize:{}", size)?;
        }
        if let Some(kind) = &self.memory_type {
            write!(f, ";MemoryType:{}", kind)?;
        }
        if let Some(size) = self.storage_size {
            write!(f, ";StorageSize:{}", size)?;
        }
        if let Some(kind) = &self.storage_type {
            write!(f, ";StorageType:{}", kind)?;
        }
        if let Some(os) = &self.operating_system_type {
            write!(f, ";OperatingSystemType:{}", os)?;
        }
        for (key, value) in &self.extra {
            write!(f, ";{}:{}", key, value)?;
        }
        Ok(())
    }
}
