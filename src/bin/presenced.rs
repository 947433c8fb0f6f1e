//! presenced - camera presence detection daemon.
//!
//! This daemon:
//! 1. Captures frames from the configured source (`stub://` or an image directory)
//! 2. Runs them through the denoise, background, correct and detect stages
//! 3. Debounces detections into occupied/clear transitions
//! 4. Publishes transitions to the log and, when enabled, to MQTT
//! 5. Logs per-stage health on a fixed interval

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use presence_pipeline::config::PresencedConfig;
use presence_pipeline::transport::mqtt::{MqttPresenceSink, MqttSinkConfig};
use presence_pipeline::{
    open_source, CancellationToken, LogSink, Pipeline, PipelineOptions, PresenceTracker,
    SharedSettings,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera presence detection daemon")]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Capture source (overrides the config file).
    #[arg(long)]
    source: Option<String>,

    /// Stop after this many frames.
    #[arg(long, value_name = "N")]
    once: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PresencedConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        if source.trim().is_empty() {
            return Err(anyhow!("--source must not be empty"));
        }
        cfg.camera.source = source;
    }
    if args.once == Some(0) {
        return Err(anyhow!("--once must be at least 1"));
    }

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        if handler_token.cancel() {
            log::info!("shutdown signal received");
        }
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let source = open_source(&cfg.camera.source, cfg.camera.width, cfg.camera.height)?;

    let mut tracker =
        PresenceTracker::new(cfg.camera.name.clone(), cfg.hold_frames).with_sink(Arc::new(LogSink));
    if cfg.mqtt.enabled {
        let sink = MqttPresenceSink::connect(&MqttSinkConfig {
            broker_addr: cfg.mqtt.broker_addr.clone(),
            topic_prefix: cfg.mqtt.topic_prefix.clone(),
            discovery_prefix: cfg.mqtt.discovery_prefix.clone(),
            client_id: cfg.mqtt.client_id.clone(),
            camera: cfg.camera.name.clone(),
            username: cfg.mqtt.username.clone(),
            password: cfg.mqtt.password.clone(),
        })?;
        log::info!("publishing presence to mqtt {}", cfg.mqtt.broker_addr);
        tracker = tracker.with_sink(Arc::new(sink));
    }

    let mut pipeline = Pipeline::build(
        PipelineOptions {
            camera: cfg.camera.name.clone(),
            fps: cfg.camera.fps,
            mailbox_capacity: cfg.pipeline.mailbox_capacity,
            stage_deadline: cfg.pipeline.stage_deadline,
            max_frames: args.once,
        },
        source,
        SharedSettings::new(cfg.algorithm.clone()),
        tracker,
        token.clone(),
    )?;
    pipeline.start()?;

    log::info!(
        "presenced running. camera={} source={} fps={} {}x{}",
        cfg.camera.name,
        cfg.camera.source,
        cfg.camera.fps,
        cfg.camera.width,
        cfg.camera.height
    );

    let mut last_health_log = Instant::now();
    while !token.wait_timeout(TICK) && pipeline.is_capturing() {
        if last_health_log.elapsed() >= cfg.health_interval {
            log::info!("health {}", pipeline.health().format());
            last_health_log = Instant::now();
        }
    }

    let outcome = if token.is_cancelled() {
        pipeline.shutdown(DRAIN_TIMEOUT)
    } else {
        pipeline.wait(DRAIN_TIMEOUT)
    };
    log::info!("final {}", pipeline.health().format());
    outcome
}
