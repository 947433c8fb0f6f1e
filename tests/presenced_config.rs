use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use presence_pipeline::config::PresencedConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_CONFIG",
        "PRESENCE_CAMERA_SOURCE",
        "PRESENCE_CAMERA_FPS",
        "PRESENCE_THRESHOLD",
        "PRESENCE_STAGE_DEADLINE_MS",
        "PRESENCE_MQTT_BROKER_ADDR",
        "PRESENCE_MQTT_ENABLED",
        "PRESENCE_MQTT_USERNAME",
        "PRESENCE_MQTT_PASSWORD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PresencedConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.name, "front_camera");
    assert_eq!(cfg.camera.source, "stub://front_camera");
    assert_eq!(cfg.camera.fps, 10);
    assert_eq!((cfg.camera.width, cfg.camera.height), (320, 240));
    assert_eq!(cfg.pipeline.mailbox_capacity, 8);
    assert_eq!(cfg.pipeline.stage_deadline, Some(Duration::from_millis(2_000)));
    assert_eq!(cfg.hold_frames, 3);
    assert!(!cfg.mqtt.enabled);
    assert_eq!(cfg.mqtt.topic_prefix, "presence");
    assert_eq!(cfg.health_interval, Duration::from_secs(5));
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "camera": { "name": "porch", "source": "stub://porch", "fps": 15, "width": 160, "height": 120 },
            "pipeline": { "mailbox_capacity": 4, "stage_deadline_ms": 500 },
            "algorithm": { "denoise_radius": 2, "threshold": 40, "min_coverage": 0.05 },
            "presence": { "hold_frames": 5 },
            "mqtt": { "enabled": true, "broker_addr": "mqtt://broker.local:1883", "client_id": "porch-cam" },
            "health": { "interval_secs": 30 }
        }"#,
    );

    std::env::set_var("PRESENCE_CONFIG", file.path());
    std::env::set_var("PRESENCE_CAMERA_FPS", "25");
    std::env::set_var("PRESENCE_THRESHOLD", "55");
    std::env::set_var("PRESENCE_MQTT_USERNAME", "ha");
    std::env::set_var("PRESENCE_MQTT_PASSWORD", "secret");

    let cfg = PresencedConfig::load().expect("load config");
    assert_eq!(cfg.camera.name, "porch");
    assert_eq!(cfg.camera.source, "stub://porch");
    assert_eq!(cfg.camera.fps, 25);
    assert_eq!((cfg.camera.width, cfg.camera.height), (160, 120));
    assert_eq!(cfg.pipeline.mailbox_capacity, 4);
    assert_eq!(cfg.pipeline.stage_deadline, Some(Duration::from_millis(500)));
    assert_eq!(cfg.algorithm.denoise_radius, 2);
    assert_eq!(cfg.algorithm.threshold, 55);
    assert!((cfg.algorithm.min_coverage - 0.05).abs() < f32::EPSILON);
    assert_eq!(cfg.hold_frames, 5);
    assert!(cfg.mqtt.enabled);
    assert_eq!(cfg.mqtt.broker_addr, "mqtt://broker.local:1883");
    assert_eq!(cfg.mqtt.client_id, "porch-cam");
    assert_eq!(cfg.mqtt.username.as_deref(), Some("ha"));
    assert_eq!(cfg.mqtt.password.as_deref(), Some("secret"));
    assert_eq!(cfg.health_interval, Duration::from_secs(30));

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
[camera]
source = "stub://garage"
fps = 5

[pipeline]
stage_deadline_ms = 0

[algorithm]
background_learning_rate = 0.1
"#,
    );

    let cfg = PresencedConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.camera.source, "stub://garage");
    assert_eq!(cfg.camera.fps, 5);
    assert_eq!(cfg.pipeline.stage_deadline, None);
    assert!((cfg.algorithm.background_learning_rate - 0.1).abs() < f32::EPSILON);
}

#[test]
fn env_overrides_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_CAMERA_SOURCE", "stub://driveway");
    std::env::set_var("PRESENCE_STAGE_DEADLINE_MS", "0");
    std::env::set_var("PRESENCE_MQTT_ENABLED", "yes");
    std::env::set_var("PRESENCE_MQTT_BROKER_ADDR", "mqtts://broker.local:8883");

    let cfg = PresencedConfig::load_from(None).expect("load env");
    assert_eq!(cfg.camera.source, "stub://driveway");
    assert_eq!(cfg.pipeline.stage_deadline, None);
    assert!(cfg.mqtt.enabled);
    assert_eq!(cfg.mqtt.broker_addr, "mqtts://broker.local:8883");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        (r#"{ "camera": { "fps": 0 } }"#, "fps"),
        (r#"{ "camera": { "fps": 500 } }"#, "fps"),
        (r#"{ "camera": { "width": 0 } }"#, "width"),
        (r#"{ "pipeline": { "mailbox_capacity": 0 } }"#, "mailbox"),
        (r#"{ "presence": { "hold_frames": 0 } }"#, "hold_frames"),
        (r#"{ "health": { "interval_secs": 0 } }"#, "health"),
        (
            r#"{ "mqtt": { "enabled": true, "broker_addr": "ws://broker:80" } }"#,
            "scheme",
        ),
    ];
    for (json, needle) in cases {
        let file = write_config(".json", json);
        let err = PresencedConfig::load_from(Some(file.path()))
            .expect_err("invalid config should be rejected");
        assert!(
            err.to_string().contains(needle),
            "{} -> {}",
            json,
            err
        );
    }
}

#[test]
fn rejects_malformed_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_THRESHOLD", "loud");
    let err = PresencedConfig::load_from(None).expect_err("threshold must be numeric");
    assert!(err.to_string().contains("PRESENCE_THRESHOLD"));
    clear_env();

    std::env::set_var("PRESENCE_MQTT_ENABLED", "sometimes");
    let err = PresencedConfig::load_from(None).expect_err("enabled must be boolean");
    assert!(err.to_string().contains("PRESENCE_MQTT_ENABLED"));
    clear_env();
}

#[test]
fn rejects_unreadable_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("missing.json");
    let err = PresencedConfig::load_from(Some(&missing)).expect_err("missing file");
    assert!(err.to_string().contains("failed to read config file"));

    let file = write_config(".json", "{ not json");
    let err = PresencedConfig::load_from(Some(file.path())).expect_err("bad json");
    assert!(err.to_string().contains("invalid config file"));
}
