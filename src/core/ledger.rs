// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Session ledger - usage sessions per machine with an explicit open-session index

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;

use super::{LedgerError, MachineId, SessionId, UsageSession};

#[derive(Default)]
struct MachineSessions {
    /// In insertion order, which is start order for a well-behaved machine
    sessions: Vec<UsageSession>,
    open: Option<SessionId>,
}

impl MachineSessions {
    fn open_session(&self) -> Option<&UsageSession> {
        let id = self.open?;
        self.sessions.iter().rev().find(|s| s.id == id)
    }

    fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().rposition(|s| s.id == id)
    }
}

/// Usage sessions for a fixed set of machines.
///
/// Every operation on one machine runs under that machine's lock, so reads
/// never observe a session mid-close and machines never contend.
pub struct SessionLedger {
    machines: BTreeMap<MachineId, RwLock<MachineSessions>>,
    next_id: AtomicU64,
}

impl SessionLedger {
    pub fn new(machine_ids: impl IntoIterator<Item = MachineId>) -> Self {
        Self {
            machines: machine_ids
                .into_iter()
                .map(|id| (id, RwLock::new(MachineSessions::default())))
                .collect(),
            next_id: AtomicU64::new(1),
        }
    }

    fn machine(&self, machine_id: MachineId) -> Result<&RwLock<MachineSessions>, LedgerError> {
        self.machines
            .get(&machine_id)
            .ok_or(LedgerError::UnknownMachine(machine_id))
    }

    /// Reserve the id for the next session
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a new session starting at `start_time`
    pub fn open_session(
        &self,
        machine_id: MachineId,
        start_time: DateTime<Utc>,
    ) -> Result<UsageSession, LedgerError> {
        // Check first so a rejected open does not burn an id
        if let Some(open) = self.find_open_session(machine_id)? {
            return Err(LedgerError::SessionAlreadyOpen {
                machine_id,
                session_id: open.id,
            });
        }
        let session = UsageSession::opened(self.next_session_id(), machine_id, start_time);
        self.insert_open(session)
    }

    /// Insert an already-built open session, e.g. one whose id was reserved
    /// before it was written to storage.
    pub fn insert_open(&self, session: UsageSession) -> Result<UsageSession, LedgerError> {
        let mut machine = self.machine(session.machine_id)?.write();

        if let Some(open) = machine.open {
            return Err(LedgerError::SessionAlreadyOpen {
                machine_id: session.machine_id,
                session_id: open,
            });
        }

        machine.open = Some(session.id);
        machine.sessions.push(session.clone());
        Ok(session)
    }

    /// Close the open session at `end_time`. See [`UsageSession::closed_at`]
    /// for how an end before the start is handled.
    pub fn close_session(
        &self,
        machine_id: MachineId,
        end_time: DateTime<Utc>,
    ) -> Result<UsageSession, LedgerError> {
        let mut machine = self.machine(machine_id)?.write();

        let open_id = machine.open.ok_or(LedgerError::NoOpenSession(machine_id))?;
        let index = machine
            .position(open_id)
            .ok_or(LedgerError::NoOpenSession(machine_id))?;

        let closed = machine.sessions[index].closed_at(end_time).session;
        machine.sessions[index] = closed.clone();
        machine.open = None;

        Ok(closed)
    }

    pub fn find_open_session(&self, machine_id: MachineId) -> Result<Option<UsageSession>, LedgerError> {
        Ok(self.machine(machine_id)?.read().open_session().cloned())
    }

    /// Sessions for one machine started at or after `since`, newest first
    pub fn list_sessions(
        &self,
        machine_id: MachineId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageSession>, LedgerError> {
        let machine = self.machine(machine_id)?.read();

        let mut sessions: Vec<UsageSession> = machine
            .sessions
            .iter()
            .filter(|s| since.map_or(true, |since| s.start_time >= since))
            .cloned()
            .collect();
        drop(machine);

        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    /// Sessions across all machines started at or after `since`
    pub fn all_sessions(&self, since: Option<DateTime<Utc>>) -> Vec<UsageSession> {
        let mut sessions = Vec::new();
        for machine in self.machines.values() {
            let machine = machine.read();
            sessions.extend(
                machine
                    .sessions
                    .iter()
                    .filter(|s| since.map_or(true, |since| s.start_time >= since))
                    .cloned(),
            );
        }
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        sessions
    }

    /// Every open session, ordered by machine id
    pub fn open_sessions_snapshot(&self) -> Vec<UsageSession> {
        self.machines
            .values()
            .filter_map(|machine| machine.read().open_session().cloned())
            .collect()
    }

    /// Drop closed sessions that ended before `cutoff`. Open sessions are kept
    /// regardless of age.
    pub fn prune_closed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for machine in self.machines.values() {
            let mut machine = machine.write();
            let before = machine.sessions.len();
            machine
                .sessions
                .retain(|s| s.end_time.map_or(true, |end| end >= cutoff));
            removed += before - machine.sessions.len();
        }
        removed
    }

    /// Load persisted sessions.
    ///
    /// Returns sessions that had to be closed because a machine had more than
    /// one open session; all but the newest are closed at the next one's start.
    /// The caller is expected to persist those.
    pub fn restore(&self, sessions: impl IntoIterator<Item = UsageSession>) -> Vec<UsageSession> {
        let mut sessions: Vec<UsageSession> = sessions.into_iter().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

        let mut repaired = Vec::new();
        let mut max_id = 0;

        for session in sessions {
            max_id = max_id.max(session.id);

            let Some(slot) = self.machines.get(&session.machine_id) else {
                warn!(
                    "Ignoring session {} for unconfigured machine {}",
                    session.id, session.machine_id
                );
                continue;
            };
            let mut machine = slot.write();

            if session.is_open() {
                if let Some(open_id) = machine.open {
                    if let Some(index) = machine.position(open_id) {
                        let closed = machine.sessions[index].closed_at(session.start_time).session;
                        warn!(
                            "Machine {} had open sessions {} and {}; closing {}",
                            session.machine_id, open_id, session.id, open_id
                        );
                        machine.sessions[index] = closed.clone();
                        repaired.push(closed);
                    }
                }
                machine.open = Some(session.id);
            }
            machine.sessions.push(session);
        }

        self.next_id.fetch_max(max_id + 1, Ordering::Relaxed);
        repaired
    }
}
