//! MQTT presence sink with Home Assistant discovery.
//!
//! Topics (with the default prefixes and camera `porch`):
//! - `presence/porch/state`: `ON` / `OFF`, retained
//! - `presence/porch/attributes`: JSON `PresenceEvent`, retained
//! - `presence/status`: `online` / `offline` availability, retained, `offline` as LWT
//! - `homeassistant/binary_sensor/<device>/porch_presence/config`: discovery, retained

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::presence::{PresenceEvent, PresenceSink};

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_TOPIC_PREFIX: &str = "presence";
pub const DEFAULT_CLIENT_ID: &str = "presenced";
const AVAILABILITY_TOPIC_SUFFIX: &str = "status";
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    /// `host:port`, optionally prefixed with `mqtt://` or `mqtts://`.
    pub broker_addr: String,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub client_id: String,
    pub camera: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

/// Home Assistant MQTT discovery config for the presence binary sensor.
#[derive(Serialize)]
struct HaBinarySensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    json_attributes_topic: String,
    device_class: String,
    payload_on: String,
    payload_off: String,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: HaDeviceInfo,
}

#[derive(Clone, Serialize)]
struct HaDeviceInfo {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
    model: String,
    sw_version: String,
}

struct Topics {
    state: String,
    attributes: String,
    availability: String,
    discovery: String,
}

impl Topics {
    fn new(config: &MqttSinkConfig) -> Self {
        let camera = sanitize_for_id(&config.camera);
        Self {
            state: format!("{}/{}/state", config.topic_prefix, camera),
            attributes: format!("{}/{}/attributes", config.topic_prefix, camera),
            availability: format!("{}/{}", config.topic_prefix, AVAILABILITY_TOPIC_SUFFIX),
            discovery: format!(
                "{}/binary_sensor/{}/{}_presence/config",
                config.discovery_prefix,
                sanitize_for_id(&config.client_id),
                camera
            ),
        }
    }
}

/// Publishes presence transitions to an MQTT broker.
///
/// Publishing never blocks: if the client's request queue is full the event is
/// reported as an error and dropped.
pub struct MqttPresenceSink {
    client: Client,
    topics: Topics,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPresenceSink {
    pub fn connect(config: &MqttSinkConfig) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&config.broker_addr)?;
        let topics = Topics::new(config);

        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = config.username.as_deref() {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            topics.availability.as_str(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        } else {
            options.set_transport(Transport::tcp());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(connection, stopping.clone())?;
        log::info!(
            "MQTT: publishing {} to {}:{} (TLS: {}, auth: {})",
            config.camera,
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            config.username.is_some()
        );

        let sink = Self {
            client,
            topics,
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        };
        sink.announce(config)?;
        Ok(sink)
    }

    fn announce(&self, config: &MqttSinkConfig) -> Result<()> {
        let discovery = HaBinarySensorConfig {
            name: format!("{} presence", config.camera),
            unique_id: format!(
                "{}_{}_presence",
                sanitize_for_id(&config.client_id),
                sanitize_for_id(&config.camera)
            ),
            state_topic: self.topics.state.clone(),
            json_attributes_topic: self.topics.attributes.clone(),
            device_class: "occupancy".to_string(),
            payload_on: PAYLOAD_ON.to_string(),
            payload_off: PAYLOAD_OFF.to_string(),
            availability_topic: self.topics.availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: HaDeviceInfo {
                identifiers: vec![sanitize_for_id(&config.client_id)],
                name: "Presence pipeline".to_string(),
                manufacturer: "presence-pipeline".to_string(),
                model: "presenced".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        self.publish_qos1(&self.topics.discovery, &serde_json::to_vec(&discovery)?, true)?;
        self.publish_qos1(&self.topics.availability, PAYLOAD_ONLINE.as_bytes(), true)?;
        self.publish_qos1(&self.topics.state, PAYLOAD_OFF.as_bytes(), true)?;
        log::debug!("MQTT: published discovery to {}", self.topics.discovery);
        Ok(())
    }

    fn publish_qos1(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .with_context(|| format!("MQTT publish to {} failed", topic))
    }
}

impl PresenceSink for MqttPresenceSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn publish(&self, event: &PresenceEvent) -> Result<()> {
        let state = if event.present { PAYLOAD_ON } else { PAYLOAD_OFF };
        self.publish_qos1(&self.topics.attributes, &serde_json::to_vec(event)?, true)?;
        self.publish_qos1(&self.topics.state, state.as_bytes(), true)
    }

    fn close(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.publish_qos1(&self.topics.availability, PAYLOAD_OFFLINE.as_bytes(), true)?;
        self.client.try_disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("MQTT connection handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log::info!("MQTT: disconnected");
        Ok(())
    }
}

fn spawn_connection(
    mut connection: Connection,
    stopping: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        })
        .map_err(|e| anyhow!("failed to spawn MQTT connection thread: {}", e))
}

fn sanitize_for_id(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
