// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Machine simulator for demo/testing

use async_trait::async_trait;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::prelude::*;
use rand_distr::{Normal, UnitSphere};
use std::time::Duration;

use super::{SampleSource, SensorSample, SourceStatus};
use crate::config::SimulatorConfig;
use crate::core::MachineId;

/// Simulates a room full of machines starting and stopping at random
pub struct MachineSimulator {
    id: String,
    status: SourceStatus,
    rng: StdRng,
    tick: Duration,
    flip_probability: f64,
    running_magnitude: f64,
    noise: Normal<f64>,
    running: Vec<bool>,
    first_tick: bool,
}

impl MachineSimulator {
    pub fn new(config: &SimulatorConfig, machine_count: u32, threshold: f64) -> Result<Self> {
        Self::build(config, machine_count, threshold, StdRng::from_entropy())
    }

    /// Deterministic simulator for tests and reproducible demos
    pub fn with_seed(config: &SimulatorConfig, machine_count: u32, threshold: f64, seed: u64) -> Result<Self> {
        Self::build(config, machine_count, threshold, StdRng::seed_from_u64(seed))
    }

    fn build(config: &SimulatorConfig, machine_count: u32, threshold: f64, rng: StdRng) -> Result<Self> {
        let noise = Normal::new(0.0, threshold * config.noise_factor)
            .context("simulator noise_factor must be non-negative")?;

        Ok(Self {
            id: "simulator".to_string(),
            status: SourceStatus::Disconnected,
            rng,
            tick: Duration::from_millis(config.tick_ms.max(1)),
            flip_probability: config.flip_probability.clamp(0.0, 1.0),
            running_magnitude: threshold * config.running_factor,
            noise,
            running: vec![false; machine_count as usize],
            first_tick: true,
        })
    }

    /// Whether the simulated machine is currently running
    pub fn is_running(&self, machine_id: MachineId) -> bool {
        machine_id
            .checked_sub(1)
            .and_then(|i| self.running.get(i as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Advance every machine by one tick and produce its reading
    pub fn generate_tick(&mut self, at: DateTime<Utc>) -> Vec<SensorSample> {
        let mut samples = Vec::with_capacity(self.running.len());

        for index in 0..self.running.len() {
            if self.rng.gen::<f64>() < self.flip_probability {
                self.running[index] = !self.running[index];
            }

            let [mut ax, mut ay, mut az] = if self.running[index] {
                // Drum spin: strong vibration along a random direction
                let direction: [f64; 3] = UnitSphere.sample(&mut self.rng);
                direction.map(|d| d * self.running_magnitude)
            } else {
                [0.0; 3]
            };
            ax += self.noise.sample(&mut self.rng);
            ay += self.noise.sample(&mut self.rng);
            az += self.noise.sample(&mut self.rng);

            samples.push(SensorSample::new(index as MachineId + 1, ax, ay, az, at));
        }

        samples
    }
}

#[async_trait]
impl SampleSource for MachineSimulator {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> SourceStatus {
        self.status
    }

    async fn connect(&mut self) -> Result<()> {
        self.status = SourceStatus::Active;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.status = SourceStatus::Disconnected;
        Ok(())
    }

    async fn next_samples(&mut self) -> Result<Vec<SensorSample>> {
        if self.first_tick {
            self.first_tick = false;
        } else {
            tokio::time::sleep(self.tick).await;
        }
        Ok(self.generate_tick(Utc::now()))
    }
}
