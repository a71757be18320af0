// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Machine registry - current running/idle state per machine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;

use super::{MachineId, MachineState, RegistryError};

/// Fixed set of tracked machines. The key set never changes after
/// construction, so each machine's state sits behind its own lock.
pub struct MachineRegistry {
    machines: BTreeMap<MachineId, RwLock<MachineState>>,
}

impl MachineRegistry {
    /// Create machines `1..=count`, all idle with no transition time
    pub fn new(count: u32, name_prefix: &str) -> Self {
        let machines = (1..=count)
            .map(|id| {
                let name = format!("{} {}", name_prefix, id);
                (id, RwLock::new(MachineState::idle(id, name)))
            })
            .collect();

        Self { machines }
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.machines.keys().copied()
    }

    pub fn get(&self, machine_id: MachineId) -> Result<MachineState, RegistryError> {
        self.machines
            .get(&machine_id)
            .map(|state| state.read().clone())
            .ok_or(RegistryError::NotFound(machine_id))
    }

    /// Flip `machine_id` from `expected_running` to `new_running`.
    ///
    /// Returns `Ok(false)` without touching the machine when its current state
    /// no longer matches `expected_running`; the caller re-reads and decides
    /// again.
    pub fn compare_and_set(
        &self,
        machine_id: MachineId,
        expected_running: bool,
        new_running: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let slot = self
            .machines
            .get(&machine_id)
            .ok_or(RegistryError::NotFound(machine_id))?;

        let mut state = slot.write();
        if state.is_running != expected_running {
            return Ok(false);
        }

        state.is_running = new_running;
        state.last_transition_at = Some(match state.last_transition_at {
            Some(previous) if previous > at => previous,
            _ => at,
        });

        Ok(true)
    }

    /// All machines in id order
    pub fn snapshot(&self) -> Vec<MachineState> {
        self.machines.values().map(|state| state.read().clone()).collect()
    }

    /// Load persisted states. States for machines outside the configured
    /// set are skipped.
    pub fn restore(&self, states: impl IntoIterator<Item = MachineState>) {
        for restored in states {
            match self.machines.get(&restored.machine_id) {
                Some(slot) => *slot.write() = restored,
                None => warn!(
                    "Ignoring persisted state for unconfigured machine {}",
                    restored.machine_id
                ),
            }
        }
    }
}
