//! Durable storage seam for transitions

use anyhow::Result;
use parking_lot::Mutex;

use super::{MachineState, UsageSession};
use crate::sensors::SensorSample;

/// Everything one transition writes. A store applies it all or nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommit {
    pub machine: MachineState,
    /// Session closed by this transition (a normal stop, or a stale session
    /// closed ahead of a start)
    pub closed: Option<UsageSession>,
    pub opened: Option<UsageSession>,
}

/// State loaded at startup
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub machines: Vec<MachineState>,
    pub sessions: Vec<UsageSession>,
}

/// Persistence used by the transition engine
pub trait TransitionStore: Send + Sync {
    /// Write one transition atomically
    fn persist(&self, commit: &TransitionCommit) -> Result<()>;

    /// Audit trail of raw samples; stores may ignore it
    fn record_reading(&self, _sample: &SensorSample, _magnitude: f64) -> Result<()> {
        Ok(())
    }
}

/// Store that keeps commits in memory. Used in demo mode without a database
/// and in tests.
#[derive(Default)]
pub struct MemoryStore {
    commits: Mutex<Vec<TransitionCommit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> Vec<TransitionCommit> {
        self.commits.lock().clone()
    }
}

impl TransitionStore for MemoryStore {
    fn persist(&self, commit: &TransitionCommit) -> Result<()> {
        self.commits.lock().push(commit.clone());
        Ok(())
    }
}
