// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! SpinWatch - Laundry Machine Usage Monitor
//!
//! Tracks whether each machine in a laundry room is running from the
//! vibration its accelerometer reports, and keeps a history of usage
//! sessions:
//! - Serial (raw `id,ax,ay,az` or `MACHINE:<id>:<status>` lines) and MQTT ingestion
//! - Threshold classification with at most one open session per machine
//! - SQLite persistence with restart recovery and retention cleanup
//! - Retained MQTT status messages for every transition
//! - Usage analytics and quiet-time recommendations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SpinWatch                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌──────────┐  ┌───────────┐                 │
//! │  │  Serial  │  │   MQTT   │  │ Simulator │  sample sources │
//! │  └────┬─────┘  └────┬─────┘  └─────┬─────┘                 │
//! │       └─────────────┼──────────────┘                       │
//! │                     ↓  SensorManager                       │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ TransitionEngine: registry + session ledger         │   │
//! │  └───────┬──────────────────────────────┬──────────────┘   │
//! │          ↓                              ↓                  │
//! │  ┌──────────────┐              ┌──────────────────┐        │
//! │  │   Database   │              │ Event Bus → MQTT │        │
//! │  └──────────────┘              └──────────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod core;
pub mod sensors;
pub mod streaming;
pub mod config;
pub mod db;
pub mod analytics;

// Re-exports for convenience
pub use config::Config;
pub use core::{EventBus, IngestError, TransitionEngine, TransitionResult};
pub use sensors::{SampleSource, SensorManager, SensorSample};
pub use streaming::StreamingManager;
pub use db::Database;

/// SpinWatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// SpinWatch name
pub const NAME: &str = "SpinWatch";

/// Build info, logged at startup
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION.to_string(),
        target: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        features: enabled_features(),
    }
}

/// Build information
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Version string
    pub version: String,
    /// Target architecture
    pub target: String,
    /// Operating system
    pub os: String,
    /// Enabled features
    pub features: Vec<String>,
}

fn enabled_features() -> Vec<String> {
    let mut features = vec![];

    #[cfg(feature = "serial")]
    features.push("serial".to_string());

    features
}
