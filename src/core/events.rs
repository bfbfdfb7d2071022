//! Process-wide lifecycle event stream
//!
//! Events are appended in a single total order: the sequence number and the
//! monotonic timestamp are both assigned under the log lock, so a later
//! sequence never carries an earlier timestamp.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::errors::Result;
use crate::graph::{AppId, TaskId};

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    TaskSubmitted {
        task_id: TaskId,
        app_id: AppId,
        signature: String,
        predecessors: usize,
    },
    TaskReady {
        task_id: TaskId,
    },
    TaskRunning {
        task_id: TaskId,
        attempt: u32,
    },
    TaskFinished {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    TaskRetried {
        task_id: TaskId,
        retry_id: TaskId,
        attempt: u32,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    FailureIgnored {
        task_id: TaskId,
        reason: String,
    },
    GroupOpened {
        app_id: AppId,
        name: String,
    },
    GroupClosed {
        app_id: AppId,
        name: String,
        members: usize,
    },
    BarrierReached {
        app_id: AppId,
        group: Option<String>,
        failures: usize,
    },
    DataDeleted {
        data: String,
    },
    /// Emitted by the application through `emit_event`
    User {
        event_type: i32,
        id: i64,
    },
}

impl RuntimeEvent {
    /// Numeric type code, stable across releases
    pub fn code(&self) -> i32 {
        match self {
            Self::TaskSubmitted { .. } => 1,
            Self::TaskReady { .. } => 2,
            Self::TaskRunning { .. } => 3,
            Self::TaskFinished { .. } => 4,
            Self::TaskFailed { .. } => 5,
            Self::TaskRetried { .. } => 6,
            Self::TaskCancelled { .. } => 7,
            Self::FailureIgnored { .. } => 8,
            Self::GroupOpened { .. } => 10,
            Self::GroupClosed { .. } => 11,
            Self::BarrierReached { .. } => 12,
            Self::DataDeleted { .. } => 20,
            Self::User { event_type, .. } => *event_type,
        }
    }

    /// Task the event refers to, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskSubmitted { task_id, .. }
            | Self::TaskReady { task_id }
            | Self::TaskRunning { task_id, .. }
            | Self::TaskFinished { task_id }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRetried { task_id, .. }
            | Self::TaskCancelled { task_id }
            | Self::FailureIgnored { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Event envelope with ordering metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    /// Nanoseconds since the emitter was created; never decreases
    pub timestamp: u64,
    pub wall_time: DateTime<Utc>,
    pub event: RuntimeEvent,
}

/// Event sink trait for consumers of the stream
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &Event) {
        tracing::debug!(sequence = event.sequence, "Event: {:?}", event.event);
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<Event>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, event: &Event) {
        self.events.write().push(event.clone());
    }
}

struct EventLog {
    next_sequence: u64,
    last_timestamp: u64,
    entries: Vec<Event>,
}

/// Append-only emitter shared by every component
pub struct EventEmitter {
    started: Instant,
    record: bool,
    log: RwLock<EventLog>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventEmitter {
    pub fn new(record: bool) -> Self {
        Self {
            started: Instant::now(),
            record,
            log: RwLock::new(EventLog {
                next_sequence: 0,
                last_timestamp: 0,
                entries: Vec::new(),
            }),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn emit(&self, event: RuntimeEvent) -> u64 {
        let envelope = {
            let mut log = self.log.write();
            let elapsed = self.started.elapsed().as_nanos() as u64;
            let timestamp = elapsed.max(log.last_timestamp);
            let envelope = Event {
                sequence: log.next_sequence,
                timestamp,
                wall_time: Utc::now(),
                event,
            };
            log.next_sequence += 1;
            log.last_timestamp = timestamp;
            if self.record {
                log.entries.push(envelope.clone());
            }
            envelope
        };

        for sink in self.sinks.read().iter() {
            sink.emit(&envelope);
        }
        envelope.sequence
    }

    /// Snapshot of the recorded log
    pub fn events(&self) -> Vec<Event> {
        self.log.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.log.read().entries)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sequence_and_timestamps_are_monotonic() {
        let emitter = Arc::new(EventEmitter::new(true));
        let mut handles = vec![];
        for t in 0..4 {
            let emitter = Arc::clone(&emitter);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    emitter.emit(RuntimeEvent::User {
                        event_type: t,
                        id: i,
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let events = emitter.events();
        assert_eq!(events.len(), 200);
        for pair in events.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[test]
    fn test_sinks_receive_events_without_recording() {
        let emitter = EventEmitter::new(false);
        let sink = Arc::new(BufferingEventSink::new());
        emitter.add_sink(sink.clone());

        emitter.emit(RuntimeEvent::TaskReady { task_id: 7 });

        assert!(emitter.is_empty());
        let seen = sink.get_events();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event.task_id(), Some(7));
        assert_eq!(seen[0].event.code(), 2);
    }

    #[test]
    fn test_json_export_is_tagged() {
        let emitter = EventEmitter::new(true);
        emitter.emit(RuntimeEvent::User {
            event_type: 42,
            id: 1,
        });
        let json = emitter.to_json().unwrap();
        assert!(json.contains("\"type\": \"User\""));
        assert!(json.contains("\"event_type\": 42"));
    }
}
