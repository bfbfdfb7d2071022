use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKind {
    File,
    Object,
}

/// Process-wide name of a datum
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId {
    pub kind: DataKind,
    pub name: String,
}

impl DataId {
    pub fn file<S: Into<String>>(name: S) -> Self {
        Self {
            kind: DataKind::File,
            name: name.into(),
        }
    }

    pub fn object<S: Into<String>>(name: S) -> Self {
        Self {
            kind: DataKind::Object,
            name: name.into(),
        }
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DataKind::File => write!(f, "file:{}", self.name),
            DataKind::Object => write!(f, "object:{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn reads(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    pub fn writes(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// Who produces a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Producer {
    /// Supplied from outside the runtime (a pre-existing file)
    External,
    /// Written by the application itself through the access API
    Main,
    Task(TaskId),
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External => f.write_str("external source"),
            Self::Main => f.write_str("main program"),
            Self::Task(id) => write!(f, "task {}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionState {
    Pending,
    Written,
    /// Producer failed; the version stays unresolved
    Failed,
    /// Producer was cancelled before writing
    Cancelled,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataVersion {
    pub number: u64,
    pub producer: Producer,
    pub state: VersionState,
    pub readers: BTreeSet<TaskId>,
    /// Producer failed under IGNORE; the version carries no content of its own
    pub ignored: bool,
    /// Earlier version whose content an ignored version stands for. `None`
    /// on an ignored version means nothing was written before it, and it
    /// resolves to the datum's external name.
    pub alias_of: Option<u64>,
    /// Tasks whose in-degree includes this version's main-program write
    #[serde(skip)]
    pub(crate) waiters: Vec<TaskId>,
}

impl DataVersion {
    pub(crate) fn new(number: u64, producer: Producer, state: VersionState) -> Self {
        Self {
            number,
            producer,
            state,
            readers: BTreeSet::new(),
            ignored: false,
            alias_of: None,
            waiters: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> VersionRef {
        VersionRef {
            number: self.number,
            producer: self.producer,
            state: self.state,
        }
    }
}

/// Point-in-time view of a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionRef {
    pub number: u64,
    pub producer: Producer,
    pub state: VersionState,
}

/// Where the content of a version lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataLocation {
    File(PathBuf),
    /// In-memory reference, keyed by renaming
    Object(String),
}

impl DataLocation {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::File(path) => Some(path),
            Self::Object(_) => None,
        }
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Object(key) => write!(f, "object {}", key),
        }
    }
}

/// Renaming of version `number` of the datum with sequence `seq`
pub fn renaming(seq: u64, number: u64) -> String {
    format!("d{}v{}", seq, number)
}

/// Result of registering one parameter access
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclaredAccess {
    /// Dense per-datum sequence used in renamings
    pub seq: u64,
    /// Version bound for reading (IN / INOUT)
    pub read: Option<VersionRef>,
    pub read_location: Option<DataLocation>,
    /// Version created for writing (OUT / INOUT)
    pub write: Option<u64>,
    pub write_location: Option<DataLocation>,
    /// Version that was current before `write` was created
    pub superseded: Option<VersionRef>,
    /// Readers of the superseded version
    pub prior_readers: Vec<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flags() {
        assert!(Direction::In.reads() && !Direction::In.writes());
        assert!(!Direction::Out.reads() && Direction::Out.writes());
        assert!(Direction::InOut.reads() && Direction::InOut.writes());
    }

    #[test]
    fn test_display() {
        assert_eq!(DataId::object("matrix").to_string(), "object:matrix");
        assert_eq!(Producer::Task(9).to_string(), "task 9");
        assert_eq!(renaming(3, 0), "d3v0");
    }
}
