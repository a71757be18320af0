// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! SpinWatch - Laundry Machine Usage Monitor
//!
//! Watches accelerometers strapped to washers and dryers, decides which
//! machines are running, and records every usage session.

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use spinwatch::{
    analytics,
    config::Config,
    core::{EventBus, MemoryStore, StoreSnapshot, TransitionEngine, TransitionStore},
    db::Database,
    sensors::{MachineSimulator, SensorManager},
    streaming::{MqttSampleSource, StreamingManager},
    NAME, VERSION,
};

/// SpinWatch - Laundry Machine Usage Monitor
#[derive(Parser, Debug)]
#[command(name = "spinwatch")]
#[command(author = "SpinWatch Project")]
#[command(version = VERSION)]
#[command(about = "Vibration-based laundry machine state detection and usage history")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Demo mode with simulated machines
    #[arg(long)]
    demo: bool,

    /// Print usage analytics as JSON and exit
    #[arg(long)]
    report: bool,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of machines
    #[arg(long, env = "NUM_MACHINES")]
    machines: Option<u32>,

    /// Vibration magnitude above which a machine is running
    #[arg(long, env = "VIBRATION_THRESHOLD")]
    threshold: Option<f64>,

    /// MQTT broker host; enables MQTT ingestion
    #[arg(long, env = "MQTT_BROKER_HOST")]
    mqtt_broker: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT")]
    mqtt_port: Option<u16>,

    /// Serial port; enables serial ingestion
    #[arg(long, env = "ARDUINO_PORT")]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long, env = "ARDUINO_BAUD_RATE")]
    baud_rate: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if self.demo {
            config.demo_mode = true;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
            config.database.path = data_dir.join("spinwatch.db");
        }
        if let Some(count) = self.machines {
            config.machines.count = count;
        }
        if let Some(threshold) = self.threshold {
            config.machines.vibration_threshold = threshold;
        }
        if let Some(broker) = &self.mqtt_broker {
            config.streaming.mqtt_enabled = true;
            config.streaming.mqtt_broker = broker.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.streaming.mqtt_port = port;
        }
        if let Some(port) = &self.serial_port {
            config.serial.enabled = true;
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud_rate {
            config.serial.baud_rate = baud;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;
    args.apply(&mut config);

    // Initialize logging
    let log_level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    config.validate()?;

    let build = spinwatch::build_info();
    info!("{} v{} - Laundry Machine Usage Monitor", NAME, build.version);
    info!("Build: {}/{}, features: {:?}", build.os, build.target, build.features);
    info!("Configuration loaded from {:?}", config_path);
    info!(
        "Tracking {} machines, threshold {}",
        config.machines.count, config.machines.vibration_threshold
    );

    if args.report {
        return print_report(&config);
    }

    info!("Demo mode: {}", config.demo_mode);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_headless(config))
}

/// Print usage analytics from the persisted store
fn print_report(config: &Config) -> Result<()> {
    if !config.database.enabled {
        bail!("--report reads the session database; enable [database] in the config");
    }

    let db = Database::open(&config.database)?;
    db.ensure_machines(&config.machines)?;

    let now = Utc::now();
    let since = now - chrono::Duration::days(config.analytics.window_days as i64);
    let machines: Vec<_> = db
        .load_machines()?
        .into_iter()
        .filter(|m| m.machine_id >= 1 && m.machine_id <= config.machines.count)
        .collect();
    let sessions = db.query_sessions(Some(since))?;
    let report = analytics::build_report(&machines, &sessions, &config.analytics, now);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run until Ctrl+C
async fn run_headless(config: Config) -> Result<()> {
    info!("Initializing...");

    let event_bus = Arc::new(EventBus::default());

    // Initialize storage
    let (store, snapshot, db): (Arc<dyn TransitionStore>, StoreSnapshot, Option<Database>) =
        if config.database.enabled {
            let db = Database::open(&config.database)?;
            db.ensure_machines(&config.machines)?;
            let snapshot = db.load_snapshot()?;
            let stats = db.get_stats()?;
            info!(
                "Database: {} sessions ({} open), {} readings, {} KB",
                stats.session_count,
                stats.open_session_count,
                stats.reading_count,
                stats.size_bytes / 1024
            );
            (Arc::new(db.clone()), snapshot, Some(db))
        } else {
            warn!("Database disabled, sessions are kept in memory only");
            (Arc::new(MemoryStore::new()), StoreSnapshot::default(), None)
        };

    let engine = Arc::new(
        TransitionEngine::restore(&config.machines, store, event_bus.clone(), snapshot)?
            .with_readings(config.database.enabled && config.database.store_readings),
    );
    info!("Transition engine initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

    // Sample sources
    let manager = Arc::new(SensorManager::new(config.ingest.clone(), engine.clone()));
    let threshold = config.machines.vibration_threshold;

    if config.serial.enabled {
        #[cfg(feature = "serial")]
        {
            let serial = spinwatch::sensors::SerialSource::new(config.serial.clone(), threshold);
            manager.add_source(Box::new(serial)).await;
        }

        #[cfg(not(feature = "serial"))]
        {
            warn!("Serial ingestion requested but this build lacks the `serial` feature");
        }
    }
    if config.streaming.mqtt_enabled {
        manager
            .add_source(Box::new(MqttSampleSource::new(config.streaming.clone())))
            .await;
    }
    if config.demo_mode {
        let simulator = MachineSimulator::new(&config.simulator, config.machines.count, threshold)?;
        manager.add_source(Box::new(simulator)).await;
    }
    if manager.source_count().await == 0 {
        warn!("No sample sources enabled; configure serial or MQTT, or pass --demo");
    }

    tasks.push(tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown_tx.subscribe();
        async move { manager.run(shutdown).await }
    }));

    // Status publishing
    if config.streaming.mqtt_enabled && config.streaming.publish_status {
        let streaming = StreamingManager::new(config.streaming.clone()).await?;
        info!("Streaming manager initialized");
        let event_bus = event_bus.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { streaming.run(event_bus, shutdown).await }));
    }

    // Retention cleanup
    if let Some(db) = db {
        let engine = engine.clone();
        let retention_days = config.database.retention_days;
        let period = std::time::Duration::from_secs(config.database.cleanup_interval_secs.max(60));
        let mut shutdown = shutdown_tx.subscribe();

        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = db.cleanup(retention_days) {
                            warn!("Retention cleanup failed: {:#}", e);
                        }
                        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
                        engine.prune_sessions(cutoff);
                    }
                    _ = shutdown.recv() => break,
                }
            }
            Ok(())
        }));
    }

    info!("SpinWatch running");
    info!("   Press Ctrl+C to shutdown");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(());

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Task finished with error: {:#}", e),
            Err(e) => error!("Task panicked: {}", e),
        }
    }

    // Sources are stopped; drain whatever ingest is still in flight
    engine.shutdown();

    for health in manager.get_all_health().await {
        info!(
            "Source {}: {} samples, {} rejected, {} reconnects",
            health.source_id, health.samples_count, health.rejected_count, health.reconnect_count
        );
    }

    let stats = engine.stats();
    info!(
        "SpinWatch shutdown complete ({} samples, {} transitions, {} anomalies, {} rejected)",
        stats.samples_ingested, stats.transitions, stats.anomalies, stats.rejected
    );

    Ok(())
}
