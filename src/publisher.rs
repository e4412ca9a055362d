// src/publisher.rs
//
// Publication seam. The pipeline publishes structured JSON records to three
// logical topics (detections, alerts, status) through `Publish`; the
// concrete transport is chosen at construction time. Publish failures are
// counted by the caller and never halt processing.

use crate::types::MqttConfig;
use anyhow::{Context, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, QoS};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Bound on joining the connection thread at teardown.
const DISCONNECT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    AtMostOnce,
    AtLeastOnce,
}

impl Delivery {
    pub fn from_level(level: u8) -> Self {
        if level == 0 {
            Self::AtMostOnce
        } else {
            Self::AtLeastOnce
        }
    }

    fn to_mqtt(self) -> QoS {
        match self {
            Self::AtMostOnce => QoS::AtMostOnce,
            Self::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

pub trait Publish: Send {
    fn publish(&self, topic: &str, payload: &Value, qos: Delivery) -> Result<()>;
}

/// Pick the transport: a broker connection when MQTT is enabled, otherwise
/// a log-only publisher for dry runs.
pub fn build_publisher(config: &MqttConfig, device_id: &str) -> Result<Box<dyn Publish>> {
    if config.enabled {
        Ok(Box::new(MqttPublisher::connect(config, device_id)?))
    } else {
        info!("MQTT disabled; payloads will be logged only");
        Ok(Box::new(LogPublisher))
    }
}

/// MQTT transport. A dedicated thread drives the broker connection; the
/// client side only enqueues outgoing messages.
pub struct MqttPublisher {
    client: Client,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn connect(config: &MqttConfig, device_id: &str) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-publisher", device_id));

        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(ref user) = config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let (client, connection) = Client::new(options, 10);
        info!("MQTT publisher connected to {}:{}", config.host, config.port);

        Ok(Self {
            client,
            connection_handle: Some(Self::drive_connection(connection)),
        })
    }

    fn drive_connection(mut connection: Connection) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        })
    }

}

impl Drop for MqttPublisher {
    /// Flush before exit: the disconnect request is queued behind any
    /// pending publishes, so joining the connection thread guarantees they
    /// reached the socket first. The join is bounded; a wedged connection
    /// is detached rather than blocking shutdown.
    fn drop(&mut self) {
        if let Err(e) = self.client.disconnect() {
            warn!("MQTT disconnect failed: {}", e);
        }
        let Some(handle) = self.connection_handle.take() else {
            return;
        };
        let deadline = Instant::now() + DISCONNECT_JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!(
                "MQTT connection thread did not stop within {:?}, detaching",
                DISCONNECT_JOIN_TIMEOUT
            );
        }
    }
}

impl Publish for MqttPublisher {
    fn publish(&self, topic: &str, payload: &Value, qos: Delivery) -> Result<()> {
        let bytes = serde_json::to_vec(payload).context("Failed to serialize payload")?;
        self.client
            .publish(topic, qos.to_mqtt(), false, bytes)
            .with_context(|| format!("Failed to publish to {}", topic))?;
        Ok(())
    }
}

/// Log-only transport for running without a broker.
pub struct LogPublisher;

impl Publish for LogPublisher {
    fn publish(&self, topic: &str, payload: &Value, _qos: Delivery) -> Result<()> {
        let text = payload.to_string();
        let shown: String = text.chars().take(200).collect();
        info!("[dry-run] {} <- {}", topic, shown);
        Ok(())
    }
}
