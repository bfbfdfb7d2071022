//! Version tracker: current version and access state of every datum.
//!
//! Each datum owns its own mutex and condition variable, so accesses to
//! unrelated data never contend. The tracker never calls back into the
//! scheduler; operations that unblock tasks return the ids to release.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::model::{
    renaming, DataId, DataKind, DataLocation, DataVersion, DeclaredAccess, Direction, Producer,
    VersionRef, VersionState,
};
use crate::core::errors::{Result, RuntimeError};
use crate::graph::TaskId;

struct DataEntry {
    seq: u64,
    info: Mutex<DataInfo>,
    changed: Condvar,
}

#[derive(Default)]
struct DataInfo {
    next_version: u64,
    current: Option<u64>,
    versions: BTreeMap<u64, DataVersion>,
    deleted: bool,
    main_reads: usize,
    main_write: Option<u64>,
}

impl DataInfo {
    fn create_version(&mut self, producer: Producer, state: VersionState) -> u64 {
        let number = self.next_version;
        self.next_version += 1;
        self.versions.insert(number, DataVersion::new(number, producer, state));
        self.current = Some(number);
        self.deleted = false;
        number
    }

    fn current_version(&self) -> Option<&DataVersion> {
        self.current.and_then(|number| self.versions.get(&number))
    }

    fn pending_version(&self) -> Option<u64> {
        self.versions
            .values()
            .find(|version| version.state == VersionState::Pending)
            .map(|version| version.number)
    }

    fn version_mut(&mut self, data: &DataId, number: u64) -> Result<&mut DataVersion> {
        self.versions.get_mut(&number).ok_or_else(|| {
            RuntimeError::invariant(format!("{} has no tracked version {}", data, number))
        })
    }

    fn clear(&mut self) {
        for version in self.versions.values_mut() {
            version.state = VersionState::Deleted;
        }
        self.versions.clear();
        self.current = None;
        self.deleted = true;
        self.main_reads = 0;
    }
}

/// Owner of every `DataVersion`
pub struct VersionTracker {
    working_dir: PathBuf,
    entries: DashMap<DataId, Arc<DataEntry>>,
    next_seq: AtomicU64,
}

impl VersionTracker {
    pub fn new<P: Into<PathBuf>>(working_dir: P) -> Self {
        Self {
            working_dir: working_dir.into(),
            entries: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    fn entry(&self, data: &DataId) -> Arc<DataEntry> {
        if let Some(entry) = self.entries.get(data) {
            return Arc::clone(entry.value());
        }
        self.entries
            .entry(data.clone())
            .or_insert_with(|| {
                Arc::new(DataEntry {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    info: Mutex::new(DataInfo::default()),
                    changed: Condvar::new(),
                })
            })
            .value()
            .clone()
    }

    fn lookup(&self, data: &DataId) -> Result<Arc<DataEntry>> {
        self.entries
            .get(data)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::UnknownData(data.clone()))
    }

    fn location_in(&self, data: &DataId, seq: u64, info: &DataInfo, number: u64) -> DataLocation {
        let (number, external) = match info.versions.get(&number) {
            Some(version) => {
                if version.ignored && version.alias_of.is_none() {
                    (number, true)
                } else {
                    let target = version.alias_of.unwrap_or(number);
                    let producer = info
                        .versions
                        .get(&target)
                        .map_or(version.producer, |aliased| aliased.producer);
                    (target, producer == Producer::External)
                }
            }
            None => (number, false),
        };
        match data.kind {
            DataKind::File if external => {
                DataLocation::File(PathBuf::from(&data.name))
            }
            DataKind::File => DataLocation::File(self.working_dir.join(renaming(seq, number))),
            DataKind::Object => DataLocation::Object(renaming(seq, number)),
        }
    }

    /// Register an access by `producer`.
    ///
    /// Reads bind the current version (creating an externally supplied one
    /// if the datum has none) and record the reader. Writes create the next
    /// version. A write fails with `ConcurrentWriteConflict` while the
    /// current version is pending on another producer, unless that producer
    /// is listed in `acknowledged`.
    pub fn declare_access(
        &self,
        data: &DataId,
        direction: Direction,
        producer: Producer,
        acknowledged: &[Producer],
    ) -> Result<DeclaredAccess> {
        let entry = self.entry(data);
        let mut info = entry.info.lock();

        if direction.writes() {
            if let Some(current) = info.current_version() {
                if current.state == VersionState::Pending
                    && current.producer != producer
                    && !acknowledged.contains(&current.producer)
                {
                    return Err(RuntimeError::ConcurrentWriteConflict {
                        data: data.clone(),
                        version: current.number,
                        producer: current.producer,
                    });
                }
            }
        }

        let mut access = DeclaredAccess {
            seq: entry.seq,
            ..DeclaredAccess::default()
        };

        if direction.reads() {
            let number = match info.current {
                Some(number) => number,
                None => info.create_version(Producer::External, VersionState::Written),
            };
            let version = info.version_mut(data, number)?;
            if let Producer::Task(id) = producer {
                version.readers.insert(id);
            }
            access.read = Some(version.snapshot());
            access.read_location = Some(self.location_in(data, entry.seq, &info, number));
        }

        if direction.writes() {
            if let Some(previous) = info.current_version() {
                access.superseded = Some(previous.snapshot());
                access.prior_readers = previous.readers.iter().copied().collect();
            }
            let number = info.create_version(producer, VersionState::Pending);
            access.write = Some(number);
            access.write_location = Some(self.location_in(data, entry.seq, &info, number));
        }

        debug!(
            data = %data,
            ?direction,
            %producer,
            read = ?access.read.map(|v| v.number),
            write = ?access.write,
            "Declared access"
        );
        Ok(access)
    }

    /// Resolve a pending version. Returns the tasks waiting on it
    pub fn complete(&self, data: &DataId, number: u64, success: bool) -> Result<Vec<TaskId>> {
        let entry = self.lookup(data)?;
        let waiters = {
            let mut info = entry.info.lock();
            let version = info.version_mut(data, number)?;
            if version.state != VersionState::Pending {
                return Err(RuntimeError::invariant(format!(
                    "{} version {} completed while {:?}",
                    data, number, version.state
                )));
            }
            version.state = if success {
                VersionState::Written
            } else {
                VersionState::Failed
            };
            if !success {
                warn!(data = %data, version = number, readers = version.readers.len(), "Version producer failed");
            }
            std::mem::take(&mut version.waiters)
        };
        entry.changed.notify_all();
        Ok(waiters)
    }

    /// Resolve a pending version whose producer's failure is ignored. The
    /// version keeps the content of the newest earlier written version, or
    /// falls back to the external name when there is none.
    pub fn resolve_ignored(&self, data: &DataId, number: u64) -> Result<()> {
        let entry = self.lookup(data)?;
        {
            let mut info = entry.info.lock();
            let alias = info
                .versions
                .range(..number)
                .rev()
                .find(|(_, version)| version.state == VersionState::Written)
                .and_then(|(n, version)| if version.ignored { version.alias_of } else { Some(*n) });
            let version = info.version_mut(data, number)?;
            if version.state != VersionState::Pending {
                return Err(RuntimeError::invariant(format!(
                    "{} version {} ignored while {:?}",
                    data, number, version.state
                )));
            }
            version.state = VersionState::Written;
            version.ignored = true;
            version.alias_of = alias;
        }
        entry.changed.notify_all();
        Ok(())
    }

    /// Drop a version whose producer was cancelled before running. If it was
    /// current, the datum rolls back to its newest version that was not
    /// cancelled.
    pub fn cancel_version(&self, data: &DataId, number: u64) -> Result<()> {
        let entry = self.lookup(data)?;
        {
            let mut info = entry.info.lock();
            let version = info.version_mut(data, number)?;
            if version.state != VersionState::Pending {
                return Ok(());
            }
            version.state = VersionState::Cancelled;
            if info.current == Some(number) {
                let rolled_back = info
                    .versions
                    .values()
                    .rev()
                    .find(|version| version.state != VersionState::Cancelled)
                    .map(|version| version.number);
                info.current = rolled_back;
                debug!(data = %data, cancelled = number, current = ?info.current, "Rolled back current version");
            }
        }
        entry.changed.notify_all();
        Ok(())
    }

    /// Hand the producer rights of a pending version to a retry of its task
    pub fn reassign_producer(&self, data: &DataId, number: u64, from: TaskId, to: TaskId) -> Result<()> {
        let entry = self.lookup(data)?;
        let mut info = entry.info.lock();
        let version = info.version_mut(data, number)?;
        if version.producer == Producer::Task(from) {
            version.producer = Producer::Task(to);
        }
        Ok(())
    }

    /// Add `task` as a waiter of a version still being written by the main
    /// program, incrementing `in_degree` under the datum's lock. Returns
    /// false when the version is already resolved.
    pub fn wait_on_main(
        &self,
        data: &DataId,
        number: u64,
        task: TaskId,
        in_degree: &AtomicUsize,
    ) -> Result<bool> {
        let entry = self.lookup(data)?;
        let mut info = entry.info.lock();
        let version = info.version_mut(data, number)?;
        if version.state == VersionState::Pending && version.producer == Producer::Main {
            version.waiters.push(task);
            in_degree.fetch_add(1, Ordering::AcqRel);
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete the datum, failing with `DataBusy` while any version is
    /// pending. Returns false if it was already deleted. The version counter
    /// survives the deletion.
    pub fn delete(&self, data: &DataId) -> Result<bool> {
        let entry = self.lookup(data)?;
        let deleted = {
            let mut info = entry.info.lock();
            if info.deleted {
                return Ok(false);
            }
            if let Some(version) = info.main_write.or_else(|| info.pending_version()) {
                return Err(RuntimeError::DataBusy {
                    data: data.clone(),
                    version,
                });
            }
            info.clear();
            true
        };
        entry.changed.notify_all();
        info!(data = %data, "Deleted data");
        Ok(deleted)
    }

    /// Block until no version of the datum is pending, then delete it
    pub fn delete_when_idle(&self, data: &DataId) -> Result<bool> {
        let entry = self.lookup(data)?;
        {
            let mut info = entry.info.lock();
            loop {
                if info.deleted {
                    return Ok(false);
                }
                if info.main_write.is_some() {
                    return Err(RuntimeError::invalid_access(
                        data,
                        "cannot wait for a version the main program is still writing",
                    ));
                }
                match info.pending_version() {
                    Some(version) => {
                        debug!(data = %data, version, "Waiting for producer before delete");
                        entry.changed.wait(&mut info);
                    }
                    None => break,
                }
            }
            info.clear();
        }
        entry.changed.notify_all();
        info!(data = %data, "Deleted data");
        Ok(true)
    }

    fn wait_written(&self, data: &DataId, register_read: bool) -> Result<(VersionRef, DataLocation)> {
        let entry = self.entry(data);
        let mut info = entry.info.lock();
        loop {
            if info.main_write.is_some() && info.main_write == info.current {
                return Err(RuntimeError::invalid_access(
                    data,
                    "the main program holds the current version open for writing",
                ));
            }
            let number = match info.current {
                Some(number) => number,
                None => info.create_version(Producer::External, VersionState::Written),
            };
            let version = info.version_mut(data, number)?.snapshot();
            match version.state {
                VersionState::Written => {
                    if register_read {
                        info.main_reads += 1;
                    }
                    let location = self.location_in(data, entry.seq, &info, number);
                    return Ok((version, location));
                }
                VersionState::Failed => {
                    return Err(RuntimeError::ProducerFailed {
                        data: data.clone(),
                        version: number,
                        producer: version.producer,
                    })
                }
                VersionState::Pending => {
                    debug!(data = %data, version = number, producer = %version.producer, "Waiting for version");
                    entry.changed.wait(&mut info);
                }
                VersionState::Cancelled | VersionState::Deleted => {
                    return Err(RuntimeError::invariant(format!(
                        "{} current version {} is {:?}",
                        data, number, version.state
                    )))
                }
            }
        }
    }

    /// Main-program read: block until the current version is written and
    /// register the reader.
    pub fn open_read(&self, data: &DataId) -> Result<(VersionRef, DataLocation)> {
        self.wait_written(data, true)
    }

    /// Block until the current version is written without registering a reader
    pub fn wait_readable(&self, data: &DataId) -> Result<(VersionRef, DataLocation)> {
        self.wait_written(data, false)
    }

    pub fn close_read(&self, data: &DataId) -> Result<()> {
        let entry = self.lookup(data)?;
        let mut info = entry.info.lock();
        if info.main_reads == 0 {
            return Err(RuntimeError::invalid_access(data, "not open for reading"));
        }
        info.main_reads -= 1;
        Ok(())
    }

    /// Main-program write: create a pending version produced by `Main`.
    /// The main program writes a fresh renaming, so it never waits.
    pub fn open_main_write(&self, data: &DataId) -> Result<(u64, DataLocation)> {
        let entry = self.entry(data);
        let mut info = entry.info.lock();
        if info.main_write.is_some() {
            return Err(RuntimeError::invalid_access(data, "already open for writing"));
        }
        let number = info.create_version(Producer::Main, VersionState::Pending);
        info.main_write = Some(number);
        let location = self.location_in(data, entry.seq, &info, number);
        debug!(data = %data, version = number, "Main program opened data for writing");
        Ok((number, location))
    }

    /// Commit the main program's write. Returns the version and the tasks
    /// that were waiting for it.
    pub fn close_main_write(&self, data: &DataId) -> Result<(u64, Vec<TaskId>)> {
        let entry = self.lookup(data)?;
        let result = {
            let mut info = entry.info.lock();
            let number = info
                .main_write
                .take()
                .ok_or_else(|| RuntimeError::invalid_access(data, "not open for writing"))?;
            let version = info.version_mut(data, number)?;
            version.state = VersionState::Written;
            (number, std::mem::take(&mut version.waiters))
        };
        entry.changed.notify_all();
        Ok(result)
    }

    /// Location of a version, following ignored-failure aliases
    pub fn location(&self, data: &DataId, number: u64) -> Option<DataLocation> {
        let entry = self.entries.get(data).map(|entry| Arc::clone(entry.value()))?;
        let info = entry.info.lock();
        info.versions
            .contains_key(&number)
            .then(|| self.location_in(data, entry.seq, &info, number))
    }

    pub fn current(&self, data: &DataId) -> Option<VersionRef> {
        let entry = self.entries.get(data).map(|entry| Arc::clone(entry.value()))?;
        let info = entry.info.lock();
        info.current_version().map(DataVersion::snapshot)
    }

    /// Snapshot of all tracked versions, oldest first
    pub fn versions(&self, data: &DataId) -> Vec<DataVersion> {
        match self.entries.get(data).map(|entry| Arc::clone(entry.value())) {
            Some(entry) => entry.info.lock().versions.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn is_deleted(&self, data: &DataId) -> bool {
        self.entries
            .get(data)
            .map(|entry| Arc::clone(entry.value()))
            .map(|entry| entry.info.lock().deleted)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
