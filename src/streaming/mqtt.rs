// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! MQTT client for sample ingestion and status publishing

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::StreamingConfig;
use crate::core::{IngestError, MachineId, MachineState, UsageSession};
use crate::sensors::{SampleSource, SensorSample, SourceStatus};

fn mqtt_options(config: &StreamingConfig, role: &str) -> MqttOptions {
    // Unique per process so two instances never kick each other off the broker
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let client_id = format!("{}-{}-{}", config.mqtt_client_id, role, &suffix[..8]);

    let mut options = MqttOptions::new(client_id, &config.mqtt_broker, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs.max(5)));

    if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
        options.set_credentials(username, password);
    }

    options
}

/// Topic filter matching every machine's data topic
pub fn data_topic_filter(prefix: &str) -> String {
    format!("{}/sensor/+/data", prefix)
}

pub fn status_topic(prefix: &str, machine_id: MachineId) -> String {
    format!("{}/machine/{}/status", prefix, machine_id)
}

/// Machine id embedded in a `<prefix>/sensor/<id>/data` topic
pub fn topic_machine_id(prefix: &str, topic: &str) -> Option<MachineId> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/sensor/")?;
    let (id, tail) = rest.split_once('/')?;
    if tail != "data" {
        return None;
    }
    id.parse().ok()
}

#[derive(Debug, Deserialize)]
struct BusPayload {
    machine_id: Option<MachineId>,
    ax: f64,
    ay: f64,
    az: f64,
    /// Unix seconds
    timestamp: Option<f64>,
}

/// Normalize one bus message into a sample.
///
/// The payload's `machine_id` wins; the topic supplies it when the payload
/// does not, and the two must agree when both are present. A missing
/// timestamp, or one more than `max_skew_secs` ahead of `received_at`, is
/// replaced by `received_at`.
pub fn parse_bus_message(
    prefix: &str,
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
    max_skew_secs: i64,
) -> Result<SensorSample, IngestError> {
    let message: BusPayload = serde_json::from_slice(payload)
        .map_err(|e| IngestError::MalformedSample(format!("invalid JSON on {}: {}", topic, e)))?;

    let from_topic = topic_machine_id(prefix, topic);
    let machine_id = match (message.machine_id, from_topic) {
        (Some(body), Some(topic_id)) if body != topic_id => {
            return Err(IngestError::MalformedSample(format!(
                "payload machine_id {} does not match topic {}",
                body, topic
            )));
        }
        (Some(id), _) | (None, Some(id)) => id,
        (None, None) => {
            return Err(IngestError::MalformedSample(format!("no machine_id for topic {}", topic)));
        }
    };

    let observed_at = match message.timestamp {
        Some(ts) => {
            let observed = DateTime::from_timestamp_millis((ts * 1000.0).round() as i64)
                .ok_or_else(|| IngestError::MalformedSample(format!("timestamp {} out of range", ts)))?;
            if observed > received_at + ChronoDuration::seconds(max_skew_secs) {
                debug!(
                    "Machine {} timestamp {} is ahead of local clock, using receipt time",
                    machine_id, observed
                );
                received_at
            } else {
                observed
            }
        }
        None => received_at,
    };

    Ok(SensorSample::new(machine_id, message.ax, message.ay, message.az, observed_at))
}

/// Retained status message for one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub machine_id: MachineId,
    pub name: String,
    /// `IN_USE` or `FREE`
    pub status: String,
    pub at: Option<DateTime<Utc>>,
    pub session: Option<UsageSession>,
}

impl StatusMessage {
    pub fn new(state: &MachineState, session: Option<&UsageSession>) -> Self {
        Self {
            machine_id: state.machine_id,
            name: state.name.clone(),
            status: if state.is_running { "IN_USE" } else { "FREE" }.to_string(),
            at: state.last_transition_at,
            session: session.cloned(),
        }
    }
}

/// Publishing MQTT client
pub struct MqttClient {
    client: AsyncClient,
    eventloop: JoinHandle<()>,
}

impl MqttClient {
    pub async fn new(config: &StreamingConfig, role: &str) -> Result<Self> {
        let options = mqtt_options(config, role);
        let (client, mut eventloop) = AsyncClient::new(options, 100);

        // Spawn eventloop handler
        let eventloop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT publisher connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT publisher error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!("MQTT {} client initialized for {}:{}", role, config.mqtt_broker, config.mqtt_port);
        Ok(Self { client, eventloop })
    }

    pub async fn publish_retained<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let json = serde_json::to_vec(payload)?;

        self.client.publish(topic, QoS::AtLeastOnce, true, json)
            .await
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))?;

        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let result = self.client.disconnect()
            .await
            .map_err(|e| anyhow!("MQTT disconnect failed: {}", e));
        self.eventloop.abort();
        result
    }
}

/// Subscribes to sensor data topics and yields normalized samples
pub struct MqttSampleSource {
    id: String,
    config: StreamingConfig,
    status: SourceStatus,
    connection: Option<(AsyncClient, EventLoop)>,
}

impl MqttSampleSource {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            id: format!("mqtt://{}:{}", config.mqtt_broker, config.mqtt_port),
            config,
            status: SourceStatus::Disconnected,
            connection: None,
        }
    }
}

#[async_trait]
impl SampleSource for MqttSampleSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> SourceStatus {
        self.status
    }

    async fn connect(&mut self) -> Result<()> {
        self.status = SourceStatus::Connecting;
        let options = mqtt_options(&self.config, "ingest");
        let (client, eventloop) = AsyncClient::new(options, 100);
        self.connection = Some((client, eventloop));
        // The broker connection itself is made by the first poll; the
        // subscription goes out once it is acknowledged.
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.status = SourceStatus::Disconnected;
        if let Some((client, _)) = self.connection.take() {
            // The event loop is dropped with the connection
            if let Err(e) = client.try_disconnect() {
                debug!("Error sending disconnect on {}: {}", self.id, e);
            }
        }
        Ok(())
    }

    async fn next_samples(&mut self) -> Result<Vec<SensorSample>> {
        let prefix = self.config.mqtt_topic_prefix.clone();
        let max_skew = self.config.max_clock_skew_secs;
        let (client, eventloop) = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("MQTT source not connected"))?;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    let filter = data_topic_filter(&prefix);
                    client
                        .subscribe(filter.as_str(), QoS::AtLeastOnce)
                        .await
                        .map_err(|e| anyhow!("MQTT subscribe failed: {}", e))?;
                    self.status = SourceStatus::Active;
                    info!("Subscribed to MQTT topic: {}", filter);
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    match parse_bus_message(&prefix, &msg.topic, &msg.payload, Utc::now(), max_skew) {
                        Ok(sample) => return Ok(vec![sample]),
                        Err(e) => warn!("Dropping MQTT message: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.status = SourceStatus::Error;
                    return Err(anyhow!("MQTT connection error: {}", e));
                }
            }
        }
    }
}
