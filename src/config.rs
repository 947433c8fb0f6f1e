use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::presence::DEFAULT_HOLD_FRAMES;
use crate::settings::{
    AlgorithmSettings, DEFAULT_BACKGROUND_LEARNING_RATE, DEFAULT_DENOISE_RADIUS,
    DEFAULT_MIN_COVERAGE, DEFAULT_THRESHOLD,
};
use crate::stream::DEFAULT_MAILBOX_CAPACITY;
use crate::transport::mqtt::{
    parse_mqtt_endpoint, DEFAULT_CLIENT_ID, DEFAULT_DISCOVERY_PREFIX, DEFAULT_TOPIC_PREFIX,
};

const DEFAULT_CAMERA_NAME: &str = "front_camera";
const DEFAULT_CAMERA_SOURCE: &str = "stub://front_camera";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 320;
const DEFAULT_CAMERA_HEIGHT: u32 = 240;
const DEFAULT_STAGE_DEADLINE_MS: u64 = 2_000;
const DEFAULT_MQTT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;
const MAX_CAMERA_FPS: u32 = 120;

#[derive(Debug, Deserialize, Default)]
struct PresencedConfigFile {
    camera: Option<CameraConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    algorithm: Option<AlgorithmConfigFile>,
    presence: Option<PresenceConfigFile>,
    mqtt: Option<MqttConfigFile>,
    health: Option<HealthConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    name: Option<String>,
    source: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    mailbox_capacity: Option<usize>,
    stage_deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlgorithmConfigFile {
    denoise_radius: Option<u32>,
    background_learning_rate: Option<f32>,
    threshold: Option<u8>,
    min_coverage: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PresenceConfigFile {
    hold_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker_addr: Option<String>,
    topic_prefix: Option<String>,
    discovery_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HealthConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PresencedConfig {
    pub camera: CameraSettings,
    pub pipeline: PipelineSettings,
    pub algorithm: AlgorithmSettings,
    pub hold_frames: u32,
    pub mqtt: MqttSettings,
    pub health_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub name: String,
    pub source: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mailbox_capacity: usize,
    /// `None` when the configured deadline is 0.
    pub stage_deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub enabled: bool,
    pub broker_addr: String,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl PresencedConfig {
    /// File named by `PRESENCE_CONFIG` (if set), then environment overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PRESENCE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PresencedConfigFile) -> Self {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            name: camera_file
                .name
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            source: camera_file
                .source
                .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
            fps: camera_file.fps.unwrap_or(DEFAULT_CAMERA_FPS),
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            mailbox_capacity: pipeline_file
                .mailbox_capacity
                .unwrap_or(DEFAULT_MAILBOX_CAPACITY),
            stage_deadline: deadline_from_ms(
                pipeline_file
                    .stage_deadline_ms
                    .unwrap_or(DEFAULT_STAGE_DEADLINE_MS),
            ),
        };

        let algorithm_file = file.algorithm.unwrap_or_default();
        let algorithm = AlgorithmSettings {
            denoise_radius: algorithm_file
                .denoise_radius
                .unwrap_or(DEFAULT_DENOISE_RADIUS),
            background_learning_rate: algorithm_file
                .background_learning_rate
                .unwrap_or(DEFAULT_BACKGROUND_LEARNING_RATE),
            threshold: algorithm_file.threshold.unwrap_or(DEFAULT_THRESHOLD),
            min_coverage: algorithm_file.min_coverage.unwrap_or(DEFAULT_MIN_COVERAGE),
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            enabled: mqtt_file.enabled.unwrap_or(false),
            broker_addr: mqtt_file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER_ADDR.to_string()),
            topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            discovery_prefix: mqtt_file
                .discovery_prefix
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
        };

        Self {
            camera,
            pipeline,
            algorithm,
            hold_frames: file
                .presence
                .and_then(|presence| presence.hold_frames)
                .unwrap_or(DEFAULT_HOLD_FRAMES),
            mqtt,
            health_interval: Duration::from_secs(
                file.health
                    .and_then(|health| health.interval_secs)
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("PRESENCE_CAMERA_SOURCE") {
            if !source.trim().is_empty() {
                self.camera.source = source;
            }
        }
        if let Ok(fps) = std::env::var("PRESENCE_CAMERA_FPS") {
            self.camera.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_CAMERA_FPS must be an integer"))?;
        }
        if let Ok(threshold) = std::env::var("PRESENCE_THRESHOLD") {
            self.algorithm.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_THRESHOLD must be an integer in 1..=255"))?;
        }
        if let Ok(deadline) = std::env::var("PRESENCE_STAGE_DEADLINE_MS") {
            let ms: u64 = deadline.trim().parse().map_err(|_| {
                anyhow!("PRESENCE_STAGE_DEADLINE_MS must be an integer number of milliseconds")
            })?;
            self.pipeline.stage_deadline = deadline_from_ms(ms);
        }
        if let Ok(addr) = std::env::var("PRESENCE_MQTT_BROKER_ADDR") {
            if !addr.trim().is_empty() {
                self.mqtt.broker_addr = addr;
            }
        }
        if let Ok(enabled) = std::env::var("PRESENCE_MQTT_ENABLED") {
            self.mqtt.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("PRESENCE_MQTT_ENABLED must be true or false"))?;
        }
        if let Ok(user) = std::env::var("PRESENCE_MQTT_USERNAME") {
            if !user.trim().is_empty() {
                self.mqtt.username = Some(user);
            }
        }
        if let Ok(password) = std::env::var("PRESENCE_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera.name = self.camera.name.trim().to_string();
        if self.camera.name.is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        if self.camera.source.trim().is_empty() {
            return Err(anyhow!("camera source must not be empty"));
        }
        if self.camera.fps == 0 || self.camera.fps > MAX_CAMERA_FPS {
            return Err(anyhow!("camera fps must be in 1..={}", MAX_CAMERA_FPS));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.pipeline.mailbox_capacity == 0 {
            return Err(anyhow!("mailbox capacity must be at least 1"));
        }
        self.algorithm.validate()?;
        if self.hold_frames == 0 {
            return Err(anyhow!("hold_frames must be at least 1"));
        }
        if self.health_interval.is_zero() {
            return Err(anyhow!("health interval must be greater than zero"));
        }
        if self.mqtt.enabled {
            parse_mqtt_endpoint(&self.mqtt.broker_addr)?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PresencedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn deadline_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn zero_deadline_disables_it() {
        assert_eq!(deadline_from_ms(0), None);
        assert_eq!(deadline_from_ms(250), Some(Duration::from_millis(250)));
    }
}
