// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Sample source traits and common types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use anyhow::Result;

use crate::core::MachineId;

/// One accelerometer reading for one machine, already normalized by its adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub machine_id: MachineId,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub observed_at: DateTime<Utc>,
}

impl SensorSample {
    pub fn new(machine_id: MachineId, ax: f64, ay: f64, az: f64, observed_at: DateTime<Utc>) -> Self {
        Self { machine_id, ax, ay, az, observed_at }
    }

    pub fn now(machine_id: MachineId, ax: f64, ay: f64, az: f64) -> Self {
        Self::new(machine_id, ax, ay, az, Utc::now())
    }

    /// Synthetic sample for a source that only reports busy/free. A busy
    /// machine gets a vector comfortably above `threshold`, a free one the
    /// zero vector, so both forms go through the same classification.
    pub fn from_status(machine_id: MachineId, in_use: bool, threshold: f64, observed_at: DateTime<Utc>) -> Self {
        let ax = if in_use { threshold * 2.0 + 1.0 } else { 0.0 };
        Self::new(machine_id, ax, 0.0, 0.0, observed_at)
    }
}

/// Source operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    Disconnected,
    Connecting,
    Connected,
    Active,
    Error,
}

/// Trait for everything that feeds samples to the engine
#[async_trait]
pub trait SampleSource: Send {
    /// Source unique identifier
    fn id(&self) -> &str;

    fn status(&self) -> SourceStatus;

    /// Open the underlying connection
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Wait for the next batch of samples. An error means the connection is
    /// gone and the caller should reconnect.
    async fn next_samples(&mut self) -> Result<Vec<SensorSample>>;
}

/// Source health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub status: SourceStatus,
    pub samples_count: u64,
    pub rejected_count: u64,
    pub reconnect_count: u64,
    pub last_error: Option<String>,
    pub last_sample_at: Option<DateTime<Utc>>,
}

impl SourceHealth {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: SourceStatus::Disconnected,
            samples_count: 0,
            rejected_count: 0,
            reconnect_count: 0,
            last_error: None,
            last_sample_at: None,
        }
    }
}
