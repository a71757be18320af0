// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Sensor manager - runs every sample source and feeds the engine

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn, error, debug};

use super::{SampleSource, SensorSample, SourceHealth, SourceStatus};
use crate::config::IngestConfig;
use crate::core::{IngestError, IngestReport, TransitionEngine};

/// Reconnect delay that doubles on every failure up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self { initial, max, current: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Manages all sample sources in the system
pub struct SensorManager {
    config: IngestConfig,
    engine: Arc<TransitionEngine>,
    sources: Mutex<Vec<Box<dyn SampleSource>>>,
    health: Arc<RwLock<HashMap<String, SourceHealth>>>,
}

impl SensorManager {
    pub fn new(config: IngestConfig, engine: Arc<TransitionEngine>) -> Self {
        Self {
            config,
            engine,
            sources: Mutex::new(Vec::new()),
            health: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_source(&self, source: Box<dyn SampleSource>) {
        let id = source.id().to_string();

        self.health.write().await.insert(id.clone(), SourceHealth::new(&id));
        self.sources.lock().await.push(source);

        info!("Added sample source: {}", id);
    }

    pub async fn source_count(&self) -> usize {
        self.sources.lock().await.len()
    }

    pub async fn get_health(&self, id: &str) -> Option<SourceHealth> {
        self.health.read().await.get(id).cloned()
    }

    pub async fn get_all_health(&self) -> Vec<SourceHealth> {
        self.health.read().await.values().cloned().collect()
    }

    /// Run every added source until shutdown. Each source gets its own task
    /// and reconnects on its own schedule.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let sources = std::mem::take(&mut *self.sources.lock().await);
        info!("Starting sensor manager with {} sources...", sources.len());

        let mut tasks = JoinSet::new();
        for source in sources {
            let worker = SourceWorker {
                config: self.config.clone(),
                engine: self.engine.clone(),
                health: self.health.clone(),
            };
            tasks.spawn(worker.run(source, shutdown.resubscribe()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Source task failed: {}", e);
            }
        }

        info!("Sensor manager stopped");
        Ok(())
    }
}

struct SourceWorker {
    config: IngestConfig,
    engine: Arc<TransitionEngine>,
    health: Arc<RwLock<HashMap<String, SourceHealth>>>,
}

impl SourceWorker {
    async fn run(self, mut source: Box<dyn SampleSource>, mut shutdown: broadcast::Receiver<()>) {
        let id = source.id().to_string();
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_initial_ms),
            Duration::from_millis(self.config.reconnect_max_ms),
        );

        'connection: loop {
            let connected = tokio::select! {
                result = source.connect() => result,
                _ = shutdown.recv() => break 'connection,
            };

            match connected {
                Ok(()) => {
                    info!("Connected source: {}", id);
                    backoff.reset();
                    self.update_status(&id, source.status(), None).await;

                    loop {
                        let batch = tokio::select! {
                            batch = source.next_samples() => batch,
                            _ = shutdown.recv() => break 'connection,
                        };

                        match batch {
                            Ok(samples) => {
                                for sample in samples {
                                    self.dispatch(&id, sample).await;
                                }
                            }
                            Err(e) => {
                                warn!("Source {} dropped: {:#}", id, e);
                                self.update_status(&id, SourceStatus::Error, Some(format!("{:#}", e))).await;
                                break;
                            }
                        }
                    }

                    if let Err(e) = source.disconnect().await {
                        debug!("Error disconnecting {}: {}", id, e);
                    }
                }
                Err(e) => {
                    error!("Failed to connect source {}: {:#}", id, e);
                    self.update_status(&id, SourceStatus::Error, Some(format!("{:#}", e))).await;
                }
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting {} in {:?}", id, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => break 'connection,
            }
            if let Some(h) = self.health.write().await.get_mut(&id) {
                h.reconnect_count += 1;
            }
        }

        if let Err(e) = source.disconnect().await {
            warn!("Error disconnecting {}: {}", id, e);
        }
        self.update_status(&id, SourceStatus::Disconnected, None).await;
        info!("Source {} stopped", id);
    }

    async fn dispatch(&self, id: &str, sample: SensorSample) {
        let outcome = ingest_with_retry(&self.engine, &self.config, sample).await;

        let mut health = self.health.write().await;
        let Some(h) = health.get_mut(id) else {
            return;
        };
        match outcome {
            Ok(_) => {
                h.samples_count += 1;
                h.last_sample_at = Some(Utc::now());
            }
            Err(e) => {
                h.rejected_count += 1;
                h.last_error = Some(e.to_string());
            }
        }
    }

    async fn update_status(&self, id: &str, status: SourceStatus, error: Option<String>) {
        if let Some(h) = self.health.write().await.get_mut(id) {
            h.status = status;
            if error.is_some() {
                h.last_error = error;
            }
        }
    }
}

/// Hand one sample to the engine, retrying storage failures with a linear
/// backoff. Other rejections are final.
pub async fn ingest_with_retry(
    engine: &TransitionEngine,
    config: &IngestConfig,
    sample: SensorSample,
) -> Result<IngestReport, IngestError> {
    let mut attempt = 0;
    loop {
        match engine.ingest(sample.clone()) {
            Ok(report) => return Ok(report),
            Err(e) if e.is_retryable() && attempt < config.retry_attempts => {
                attempt += 1;
                warn!(
                    "Ingest for machine {} failed (attempt {}/{}): {}",
                    sample.machine_id, attempt, config.retry_attempts, e
                );
                sleep(Duration::from_millis(config.retry_backoff_ms * attempt as u64)).await;
            }
            Err(e) => {
                match &e {
                    IngestError::StorageFailure(_) => error!("Dropping sample for machine {}: {}", sample.machine_id, e),
                    _ => debug!("Dropping sample for machine {}: {}", sample.machine_id, e),
                }
                return Err(e);
            }
        }
    }
}
