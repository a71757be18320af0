// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Configuration module

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::streaming::StreamingConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Enable demo mode (simulated sensors)
    pub demo_mode: bool,

    /// Tracked machines
    pub machines: MachineConfig,

    /// Serial line adapter
    pub serial: SerialConfig,

    /// MQTT adapter and status publishing
    pub streaming: StreamingConfig,

    /// Adapter retry policy
    pub ingest: IngestConfig,

    /// Demo simulator
    pub simulator: SimulatorConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Analytics rollups
    pub analytics: AnalyticsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "SpinWatch".to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            demo_mode: false,
            machines: MachineConfig::default(),
            serial: SerialConfig::default(),
            streaming: StreamingConfig::default(),
            ingest: IngestConfig::default(),
            simulator: SimulatorConfig::default(),
            database: DatabaseConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {:?}", path))?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            // Create parent directories
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.machines.count == 0 {
            bail!("machines.count must be at least 1");
        }
        let threshold = self.machines.vibration_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            bail!("machines.vibration_threshold must be a finite, non-negative number (got {})", threshold);
        }
        if self.analytics.window_days == 0 {
            bail!("analytics.window_days must be at least 1");
        }
        Ok(())
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("spinwatch"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

/// Tracked machines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Number of machines; ids run from 1 to `count`
    pub count: u32,

    /// Magnitude above which a machine counts as running
    pub vibration_threshold: f64,

    /// Display names are "<prefix> <id>"
    pub name_prefix: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            count: 4,
            vibration_threshold: 1000.0,
            name_prefix: "Machine".to_string(),
        }
    }
}

/// Serial line adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,

    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    pub port: String,

    pub baud_rate: u32,

    pub read_timeout_ms: u64,

    /// Added to ids in `MACHINE:<id>:<status>` lines (firmware counts from 0)
    pub status_id_offset: u32,

    /// Send `STATUS` after connecting so the firmware reports every machine
    pub request_status_on_connect: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            status_id_offset: 1,
            request_status_on_connect: true,
        }
    }
}

/// Adapter retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Attempts per sample when storage fails
    pub retry_attempts: u32,

    pub retry_backoff_ms: u64,

    /// First reconnect delay after a source drops; doubles up to the max
    pub reconnect_initial_ms: u64,

    pub reconnect_max_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 200,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Demo simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub tick_ms: u64,

    /// Chance per tick that a machine starts or stops
    pub flip_probability: f64,

    /// Running magnitude as a multiple of the threshold
    pub running_factor: f64,

    /// Noise standard deviation as a fraction of the threshold
    pub noise_factor: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            flip_probability: 0.05,
            running_factor: 2.5,
            noise_factor: 0.1,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Enable database storage
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,

    /// Retention period in days for closed sessions and readings
    pub retention_days: u32,

    /// How often retention cleanup runs
    pub cleanup_interval_secs: u64,

    /// Keep an audit trail of every raw sample
    pub store_readings: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/spinwatch.db"),
            retention_days: 90,
            cleanup_interval_secs: 3600,
            store_readings: false,
        }
    }
}

/// Analytics rollups
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Days of history the rollups look at
    pub window_days: u32,

    /// Number of hours in the busiest-hours list
    pub busiest_slots: usize,

    /// Number of hours recommended as quiet
    pub recommended_slots: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            busiest_slots: 5,
            recommended_slots: 5,
        }
    }
}
