//! Core engine module - machine state detection and session lifecycle

mod engine;
mod error;
mod event_bus;
mod ledger;
mod magnitude;
mod registry;
mod store;

pub use engine::{EngineStats, TransitionEngine};
pub use error::{DataAnomaly, IngestError, LedgerError, RegistryError};
pub use event_bus::{Event, EventBus, EventPayload, EventType};
pub use ledger::SessionLedger;
pub use magnitude::magnitude;
pub use registry::MachineRegistry;
pub use store::{MemoryStore, StoreSnapshot, TransitionCommit, TransitionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine identifier (1-based, fixed at startup)
pub type MachineId = u32;

/// Usage session identifier
pub type SessionId = u64;

/// Current classification of a tracked machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub machine_id: MachineId,
    pub name: String,
    pub is_running: bool,
    /// Never moves backwards
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl MachineState {
    pub fn idle(machine_id: MachineId, name: impl Into<String>) -> Self {
        Self {
            machine_id,
            name: name.into(),
            is_running: false,
            last_transition_at: None,
        }
    }
}

/// One run of a machine, from idle→running to running→idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSession {
    pub id: SessionId,
    pub machine_id: MachineId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds between start and end
    pub duration_secs: Option<i64>,
}

/// Result of closing a session at a given instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub session: UsageSession,
    /// Seconds the requested end preceded the start, when it had to be clamped
    pub skew_secs: Option<i64>,
}

impl UsageSession {
    pub fn opened(id: SessionId, machine_id: MachineId, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            machine_id,
            start_time,
            end_time: None,
            duration_secs: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Close this session at `end`. An end before the start collapses the
    /// session to zero length at its start time.
    pub fn closed_at(&self, end: DateTime<Utc>) -> Closure {
        let (end_time, skew_secs) = if end < self.start_time {
            (self.start_time, Some((self.start_time - end).num_seconds()))
        } else {
            (end, None)
        };

        let mut session = self.clone();
        session.end_time = Some(end_time);
        session.duration_secs = Some((end_time - self.start_time).num_seconds());

        Closure { session, skew_secs }
    }
}

/// What a single ingest did to its machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionResult {
    NoChange,
    StartedSession(UsageSession),
    /// `None` when the machine was running without an open session
    StoppedSession(Option<UsageSession>),
}

impl TransitionResult {
    pub fn is_transition(&self) -> bool {
        !matches!(self, TransitionResult::NoChange)
    }
}

/// Outcome of one ingest call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub machine_id: MachineId,
    pub magnitude: f64,
    pub outcome: TransitionResult,
    /// Inconsistencies repaired while applying the transition
    pub anomalies: Vec<DataAnomaly>,
}
