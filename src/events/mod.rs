//! Ordered, bounded event streams for run observers.
//!
//! Each run has an append-only event sequence. Consumers pull from an offset;
//! a slow consumer can never stall the engine. When the in-memory buffer
//! overflows, the oldest events are dropped and counted. Every event is also
//! appended to the run's `events.log` for post-hoc inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Everything that can happen during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    AgentStarted,
    AgentCompleted,
    AgentFailed,
    GovernanceCheckPassed,
    GovernanceCheckFailed,
    CheckpointCreated,
    ConsensusRequested,
    ConsensusApproved,
    ConsensusRejected,
    BudgetThreshold,
    RollbackPerformed,
    RunCompleted,
    RunAborted,
}

/// One structured event in a run's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Position in the run's sequence; strictly increasing.
    pub id: u64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// An event under construction, before the bus assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub message: String,
    pub phase: Option<String>,
    pub agent_id: Option<String>,
    pub payload: Value,
}

impl EventDraft {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            phase: None,
            agent_id: None,
            payload: Value::Null,
        }
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

struct RunStream {
    buffer: VecDeque<Event>,
    next_id: u64,
    dropped: u64,
}

impl RunStream {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            next_id: 0,
            dropped: 0,
        }
    }
}

/// A page of events returned to a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Offset to pass on the next read.
    pub next_offset: u64,
    /// Total events dropped from the buffer since the run started.
    pub events_dropped: u64,
}

/// Per-run bounded event sequences with ordered delivery.
pub struct EventBus {
    capacity: usize,
    runs_root: Option<PathBuf>,
    streams: Mutex<HashMap<String, RunStream>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs_root: None,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Also append events to `<runs_root>/<run_id>/events.log`.
    pub fn with_log_root(mut self, runs_root: impl Into<PathBuf>) -> Self {
        self.runs_root = Some(runs_root.into());
        self
    }

    /// Append an event to the run's sequence. Returns the assigned id.
    pub fn emit(&self, run_id: &str, draft: EventDraft) -> u64 {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let stream = streams
            .entry(run_id.to_string())
            .or_insert_with(RunStream::new);

        let event = Event {
            id: stream.next_id,
            run_id: run_id.to_string(),
            phase: draft.phase,
            agent_id: draft.agent_id,
            event_type: draft.event_type,
            message: draft.message,
            payload: draft.payload,
            timestamp: Utc::now(),
        };
        stream.next_id += 1;

        if stream.buffer.len() == self.capacity {
            stream.buffer.pop_front();
            stream.dropped += 1;
        }
        stream.buffer.push_back(event.clone());
        drop(streams);

        self.append_log(run_id, &event);
        event.id
    }

    /// Events with `id >= from_offset`, in order.
    pub fn read_from(&self, run_id: &str, from_offset: u64) -> EventPage {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        match streams.get(run_id) {
            Some(stream) => {
                let events: Vec<Event> = stream
                    .buffer
                    .iter()
                    .filter(|e| e.id >= from_offset)
                    .cloned()
                    .collect();
                EventPage {
                    next_offset: events.last().map(|e| e.id + 1).unwrap_or(from_offset),
                    events,
                    events_dropped: stream.dropped,
                }
            }
            None => EventPage {
                events: Vec::new(),
                next_offset: from_offset,
                events_dropped: 0,
            },
        }
    }

    /// Number of events dropped for a run due to buffer overflow.
    pub fn dropped(&self, run_id: &str) -> u64 {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(run_id).map(|s| s.dropped).unwrap_or(0)
    }

    fn append_log(&self, run_id: &str, event: &Event) {
        let Some(root) = &self.runs_root else {
            return;
        };
        let path = root.join(run_id).join("events.log");
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let line = serde_json::to_string(event).unwrap_or_default();
            writeln!(file, "{line}")
        })();
        if let Err(e) = result {
            // A failing log file must not stall the run.
            warn!(run_id, error = %e, "failed to append event log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_assigns_increasing_ids() {
        let bus = EventBus::new(16);
        let a = bus.emit("run-1", EventDraft::new(EventType::RunStarted, "start"));
        let b = bus.emit(
            "run-1",
            EventDraft::new(EventType::PhaseStarted, "planning").with_phase("planning"),
        );
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_read_from_offset() {
        let bus = EventBus::new(16);
        for i in 0..5 {
            bus.emit("run-1", EventDraft::new(EventType::AgentStarted, format!("a{i}")));
        }

        let page = bus.read_from("run-1", 3);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].id, 3);
        assert_eq!(page.next_offset, 5);
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.emit("run-1", EventDraft::new(EventType::AgentStarted, format!("a{i}")));
        }

        let page = bus.read_from("run-1", 0);
        assert_eq!(page.events.len(), 3);
        assert_eq!(page.events[0].id, 2); // 0 and 1 dropped
        assert_eq!(page.events_dropped, 2);
        assert_eq!(bus.dropped("run-1"), 2);
    }

    #[test]
    fn test_runs_are_independent() {
        let bus = EventBus::new(16);
        bus.emit("run-1", EventDraft::new(EventType::RunStarted, "one"));
        bus.emit("run-2", EventDraft::new(EventType::RunStarted, "two"));

        assert_eq!(bus.read_from("run-1", 0).events.len(), 1);
        assert_eq!(bus.read_from("run-2", 0).events.len(), 1);
        assert_eq!(bus.read_from("run-3", 0).events.len(), 0);
    }

    #[test]
    fn test_events_logged_to_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let bus = EventBus::new(16).with_log_root(dir.path());
        bus.emit("run-1", EventDraft::new(EventType::RunStarted, "start"));
        bus.emit("run-1", EventDraft::new(EventType::RunCompleted, "done"));

        let log = fs::read_to_string(dir.path().join("run-1").join("events.log")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("run_started"));
        assert!(log.contains("run_completed"));
    }

    #[test]
    fn test_event_type_serde_names() {
        let json = serde_json::to_string(&EventType::ConsensusRequested).unwrap();
        assert_eq!(json, "\"consensus_requested\"");
        let json = serde_json::to_string(&EventType::BudgetThreshold).unwrap();
        assert_eq!(json, "\"budget_threshold\"");
    }
}
