//! Streaming module - MQTT sample subscription and status publishing

mod mqtt;

pub use mqtt::*;

use std::sync::Arc;
use tokio::sync::broadcast;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{Event, EventBus, EventPayload};

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Enable MQTT
    pub mqtt_enabled: bool,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keep_alive_secs: u64,

    /// Samples arrive on `<prefix>/sensor/<id>/data`, status goes out on
    /// `<prefix>/machine/<id>/status`
    pub mqtt_topic_prefix: String,

    /// Publish a retained status message on every transition
    pub publish_status: bool,

    /// Bus timestamps further ahead of the local clock than this are
    /// replaced with the receipt time
    pub max_clock_skew_secs: i64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mqtt_enabled: false,
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "spinwatch".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_keep_alive_secs: 60,
            mqtt_topic_prefix: "spinwatch".to_string(),
            publish_status: true,
            max_clock_skew_secs: 300,
        }
    }
}

/// Forwards engine transitions to MQTT as retained status messages
pub struct StreamingManager {
    config: StreamingConfig,
    publisher: MqttClient,
}

impl StreamingManager {
    pub async fn new(config: StreamingConfig) -> Result<Self> {
        let publisher = MqttClient::new(&config, "status").await?;
        Ok(Self { config, publisher })
    }

    pub async fn run(&self, event_bus: Arc<EventBus>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Publishing machine status under {}/machine/+/status", self.config.mqtt_topic_prefix);
        let mut events = event_bus.subscribe_events();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.forward(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Status publisher lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => {
                    info!("Status publisher shutting down...");
                    break;
                }
            }
        }

        self.publisher.disconnect().await
    }

    async fn forward(&self, event: &Event) {
        let EventPayload::Transition { state, session } = &event.payload else {
            return;
        };

        let message = StatusMessage::new(state, session.as_ref());
        let topic = status_topic(&self.config.mqtt_topic_prefix, state.machine_id);
        if let Err(e) = self.publisher.publish_retained(&topic, &message).await {
            warn!("Failed to publish status for machine {}: {:#}", state.machine_id, e);
        }
    }
}
