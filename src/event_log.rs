//! Append-only, totally ordered event log.
//!
//! Every task transition, claim attempt and gate evaluation is appended here
//! before the in-memory state it describes is changed. Sequence numbers start
//! at 1 and are assigned under the log's lock, so concurrent writers always
//! observe a strictly increasing counter.

use crate::core::task::{Failure, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::gate::{Checkpoint, GateReason};
use crate::orchestration::registry::ClaimConflict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Who appended an event.
pub mod actor {
    pub const SCHEDULER: &str = "scheduler";
    pub const GATE_ENFORCER: &str = "gate-enforcer";
    pub const CONFLICT_DETECTOR: &str = "conflict-detector";
    pub const NORMALIZER: &str = "normalizer";
    pub const AGGREGATOR: &str = "aggregator";
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum EventKind {
    RunStarted {
        domain: String,
        tasks: usize,
    },
    TaskDispatched {
        task: TaskId,
        key: String,
        attempt: u32,
        worker: String,
    },
    TaskTransition {
        task: TaskId,
        key: String,
        from: String,
        to: String,
    },
    ClaimAttempt {
        task: TaskId,
        resources: Vec<String>,
        granted: bool,
        conflicts: Vec<ClaimConflict>,
    },
    ClaimsReleased {
        task: TaskId,
        resources: Vec<String>,
    },
    GateEvaluated {
        task: TaskId,
        gate: String,
        checkpoint: Checkpoint,
        passed: bool,
        reasons: Vec<GateReason>,
    },
    AttemptFailed {
        task: TaskId,
        attempt: u32,
        failure: Failure,
    },
    TaskEscalated {
        task: TaskId,
        key: String,
        attempts: u32,
    },
    FindingDropped {
        source: String,
        index: usize,
        reason: String,
    },
    SeverityDefaulted {
        source: String,
        index: usize,
        value: String,
    },
    AggregationCompleted {
        health_score: f64,
        records: usize,
        excluded: usize,
    },
    RunFinished {
        completed: usize,
        escalated: usize,
        blocked: usize,
    },
}

/// A single appended entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
}

/// Durable ordered log.
///
/// No update or delete operation exists.
pub trait EventLog: Send + Sync {
    /// Append an event and return its sequence number.
    fn append(&self, actor: &str, event: EventKind) -> Result<u64>;

    /// All events with `seq >= from`, in order.
    fn read_from(&self, from: u64) -> Result<Vec<Event>>;

    /// Opaque handle identifying this log in reports.
    fn reference(&self) -> String;

    /// Sequence number of the most recent event, 0 when empty.
    fn last_seq(&self) -> Result<u64> {
        Ok(self.read_from(0)?.last().map(|e| e.seq).unwrap_or(0))
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::EventLog("event log lock poisoned".to_string())
}

/// Event log held in memory. Used by tests and one-shot runs.
#[derive(Debug)]
pub struct InMemoryEventLog {
    name: String,
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every event.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog for InMemoryEventLog {
    fn append(&self, actor: &str, event: EventKind) -> Result<u64> {
        let mut events = self.events.lock().map_err(poisoned)?;
        let seq = events.len() as u64 + 1;
        tracing::trace!(seq, actor, ?event, "append");
        events.push(Event {
            seq,
            actor: actor.to_string(),
            timestamp: Utc::now(),
            event,
        });
        Ok(seq)
    }

    fn read_from(&self, from: u64) -> Result<Vec<Event>> {
        let events = self.events.lock().map_err(poisoned)?;
        Ok(events.iter().filter(|e| e.seq >= from).cloned().collect())
    }

    fn reference(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn last_seq(&self) -> Result<u64> {
        Ok(self.events.lock().map_err(poisoned)?.len() as u64)
    }
}

struct JsonlState {
    file: File,
    next_seq: u64,
}

/// File-backed event log, one JSON object per line.
///
/// Reopening an existing file resumes numbering after its last entry.
pub struct JsonlEventLog {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlEventLog {
    /// Open or create the log at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let last = if path.exists() {
            Self::read_events(path)?.last().map(|e| e.seq).unwrap_or(0)
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(JsonlState {
                file,
                next_seq: last + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_events(path: &Path) -> Result<Vec<Event>> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn lock(&self) -> Result<MutexGuard<'_, JsonlState>> {
        self.state.lock().map_err(poisoned)
    }
}

impl std::fmt::Debug for JsonlEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlEventLog")
            .field("path", &self.path)
            .finish()
    }
}

impl EventLog for JsonlEventLog {
    fn append(&self, actor: &str, event: EventKind) -> Result<u64> {
        let mut state = self.lock()?;
        let seq = state.next_seq;
        let entry = Event {
            seq,
            actor: actor.to_string(),
            timestamp: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;
        state.next_seq += 1;
        Ok(seq)
    }

    fn read_from(&self, from: u64) -> Result<Vec<Event>> {
        // Hold the lock so a concurrent append cannot leave a partial line.
        let _state = self.lock()?;
        Ok(Self::read_events(&self.path)?
            .into_iter()
            .filter(|e| e.seq >= from)
            .collect())
    }

    fn reference(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn last_seq(&self) -> Result<u64> {
        Ok(self.lock()?.next_seq - 1)
    }
}
