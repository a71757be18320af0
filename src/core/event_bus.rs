// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Event bus for inter-component communication

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use super::{DataAnomaly, MachineId, MachineState, UsageSession};

/// Event types in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Transition,
    Anomaly,
    Rejected,
}

/// Generic event wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Machine changed state; `session` is the session opened or closed
    Transition {
        state: MachineState,
        session: Option<UsageSession>,
    },
    Anomaly(DataAnomaly),
    Rejected { machine_id: MachineId, reason: String },
}

/// Broadcast hub for engine events. Publishing never blocks and never fails;
/// events with no subscribers are dropped.
pub struct EventBus {
    event_tx: broadcast::Sender<Event>,
    event_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);

        Self {
            event_tx,
            event_counter: AtomicU64::new(0),
        }
    }

    pub fn publish_transition(&self, state: MachineState, session: Option<UsageSession>) {
        self.publish_event(EventType::Transition, EventPayload::Transition { state, session });
    }

    pub fn publish_anomaly(&self, anomaly: DataAnomaly) {
        self.publish_event(EventType::Anomaly, EventPayload::Anomaly(anomaly));
    }

    pub fn publish_rejected(&self, machine_id: MachineId, reason: &str) {
        self.publish_event(
            EventType::Rejected,
            EventPayload::Rejected {
                machine_id,
                reason: reason.to_string(),
            },
        );
    }

    fn publish_event(&self, event_type: EventType, payload: EventPayload) {
        let id = self.event_counter.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            event_type,
            timestamp: Utc::now(),
            payload,
        };
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn published_count(&self) -> u64 {
        self.event_counter.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
