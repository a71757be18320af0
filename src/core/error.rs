// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Error and anomaly taxonomy for the ingest path

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{MachineId, SessionId};

/// Reasons an ingest was rejected. None of these leave partial state behind.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown machine id {0}")]
    UnknownMachine(MachineId),

    #[error("malformed sample: {0}")]
    MalformedSample(String),

    #[error("storage failure: {0:#}")]
    StorageFailure(anyhow::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl IngestError {
    /// Whether resubmitting the same sample can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::StorageFailure(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("machine {0} not found")]
    NotFound(MachineId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("machine {0} has no session history")]
    UnknownMachine(MachineId),

    #[error("machine {machine_id} already has open session {session_id}")]
    SessionAlreadyOpen {
        machine_id: MachineId,
        session_id: SessionId,
    },

    #[error("machine {0} has no open session")]
    NoOpenSession(MachineId),
}

/// Internal inconsistency found and repaired during an ingest
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DataAnomaly {
    #[error("machine {machine_id} was idle with open session {session_id}; closed it before starting a new one")]
    StaleOpenSession {
        machine_id: MachineId,
        session_id: SessionId,
    },

    #[error("machine {machine_id} was running without an open session")]
    MissingOpenSession { machine_id: MachineId },

    #[error("session {session_id} on machine {machine_id} ended {skew_secs}s before it started; duration clamped to zero")]
    ClockSkew {
        machine_id: MachineId,
        session_id: SessionId,
        skew_secs: i64,
    },

    #[error("sample for machine {machine_id} observed at {observed_at} precedes last transition at {last_transition_at}")]
    OutOfOrderSample {
        machine_id: MachineId,
        observed_at: DateTime<Utc>,
        last_transition_at: DateTime<Utc>,
    },
}
