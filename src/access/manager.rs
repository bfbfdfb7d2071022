use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::errors::{Result, RuntimeError};
use crate::core::events::{EventEmitter, RuntimeEvent};
use crate::data::{DataId, DataLocation, VersionTracker};
use crate::scheduler::Scheduler;

/// How the main program opens a datum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Mode from the binding layer's numeric code: 0 read, 1 write, 2 read-write
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadWrite),
            other => Err(RuntimeError::InvalidTask(format!(
                "unknown access mode code {}",
                other
            ))),
        }
    }

    pub fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

impl FromStr for AccessMode {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "R" | "READ" => Ok(Self::Read),
            "W" | "WRITE" => Ok(Self::Write),
            "RW" | "READ_WRITE" | "READWRITE" => Ok(Self::ReadWrite),
            other => Err(RuntimeError::InvalidTask(format!(
                "unknown access mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("R"),
            Self::Write => f.write_str("W"),
            Self::ReadWrite => f.write_str("RW"),
        }
    }
}

/// Descriptor handed back by `open`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedData {
    pub data: DataId,
    pub version: u64,
    /// Where to read (read mode) or write (write modes)
    pub location: DataLocation,
    /// For read-write opens, the written version the new one starts from
    pub source: Option<DataLocation>,
}

/// Serves the main program's open/close/delete/get requests
pub struct AccessManager {
    tracker: Arc<VersionTracker>,
    scheduler: Arc<Scheduler>,
    events: Arc<EventEmitter>,
}

impl AccessManager {
    pub fn new(tracker: Arc<VersionTracker>, scheduler: Arc<Scheduler>, events: Arc<EventEmitter>) -> Self {
        Self {
            tracker,
            scheduler,
            events,
        }
    }

    /// Read modes block until the current version is written; write modes
    /// return at once with a fresh pending version.
    pub fn open(&self, data: &DataId, mode: AccessMode) -> Result<OpenedData> {
        let opened = match mode {
            AccessMode::Read => {
                let (version, location) = self.tracker.open_read(data)?;
                OpenedData {
                    data: data.clone(),
                    version: version.number,
                    location,
                    source: None,
                }
            }
            AccessMode::Write => {
                let (version, location) = self.tracker.open_main_write(data)?;
                OpenedData {
                    data: data.clone(),
                    version,
                    location,
                    source: None,
                }
            }
            AccessMode::ReadWrite => {
                let (_, source) = self.tracker.wait_readable(data)?;
                let (version, location) = self.tracker.open_main_write(data)?;
                OpenedData {
                    data: data.clone(),
                    version,
                    location,
                    source: Some(source),
                }
            }
        };
        debug!(data = %data, %mode, version = opened.version, "Opened data");
        Ok(opened)
    }

    /// A write close commits the version and releases the tasks waiting on
    /// it; a read close drops the main program's read registration.
    pub fn close(&self, data: &DataId, mode: AccessMode) -> Result<()> {
        if !mode.writes() {
            return self.tracker.close_read(data);
        }
        let (version, waiters) = self.tracker.close_main_write(data)?;
        debug!(data = %data, version, waiters = waiters.len(), "Committed main program write");
        for task in waiters {
            self.scheduler.release(task, None);
        }
        Ok(())
    }

    /// Delete a datum. Without `wait_for_producer`, a pending version makes
    /// this fail with `DataBusy` and leaves everything untouched.
    pub fn delete(&self, data: &DataId, wait_for_producer: bool) -> Result<bool> {
        let deleted = if wait_for_producer {
            self.tracker.delete_when_idle(data)?
        } else {
            self.tracker.delete(data)?
        };
        if deleted {
            info!(data = %data, "Data deleted by application");
            self.events.emit(RuntimeEvent::DataDeleted {
                data: data.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Location of the last version of a file, waiting for its producer
    pub fn get_file(&self, name: &str) -> Result<DataLocation> {
        let (_, location) = self.tracker.wait_readable(&DataId::file(name))?;
        Ok(location)
    }

    pub fn get_object(&self, name: &str) -> Result<OpenedData> {
        let data = DataId::object(name);
        let (version, location) = self.tracker.wait_readable(&data)?;
        Ok(OpenedData {
            data,
            version: version.number,
            location,
            source: None,
        })
    }

    pub fn delete_object(&self, name: &str, wait_for_producer: bool) -> Result<bool> {
        self.delete(&DataId::object(name), wait_for_producer)
    }
}
