//! Delivery of presence decisions to external systems.

pub mod mqtt;

pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttPresenceSink, MqttSinkConfig};
