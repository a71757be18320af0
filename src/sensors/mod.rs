//! Sensor module - sample sources and their supervision

mod manager;
mod traits;
mod serial;
mod simulator;

pub use manager::{ingest_with_retry, Backoff, SensorManager};
pub use traits::{SampleSource, SensorSample, SourceHealth, SourceStatus};
pub use serial::*;
pub use simulator::MachineSimulator;
