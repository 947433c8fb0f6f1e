//! Presence pipeline wiring.
//!
//! ```text
//! capture -> denoise -> background -> correct -> detect -> PresenceTracker
//! ```
//!
//! Every arrow is a subscription on the upstream stage's stable output, so stage
//! rebuilds never need rewiring.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::frame::{Detection, Frame, Mask};
use crate::ingest::{CameraCaptureLoop, CaptureConfig, CaptureHandle, CaptureSource};
use crate::presence::PresenceTracker;
use crate::settings::{AlgorithmSettings, SharedSettings};
use crate::stage::{Stage, StageOptions};
use crate::strategy;
use crate::stream::{BroadcastStream, Statistics, Subscription, DEFAULT_MAILBOX_CAPACITY};

const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub camera: String,
    pub fps: u32,
    pub mailbox_capacity: usize,
    pub stage_deadline: Option<Duration>,
    pub max_frames: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            camera: "camera".to_string(),
            fps: 10,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            stage_deadline: None,
            max_frames: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineHealth {
    pub frames_captured: u64,
    pub stages: Vec<(String, Statistics)>,
    pub present: bool,
    pub transitions: u64,
}

impl PipelineHealth {
    pub fn format(&self) -> String {
        let mut line = format!(
            "captured={} present={} transitions={}",
            self.frames_captured, self.present, self.transitions
        );
        for (name, stats) in &self.stages {
            line.push_str(&format!(" | {}: {}", name, stats.format()));
        }
        line
    }
}

enum CaptureState {
    Ready(CameraCaptureLoop),
    Running(CaptureHandle),
    Finished(u64),
}

pub struct Pipeline {
    options: PipelineOptions,
    token: CancellationToken,
    settings: SharedSettings<AlgorithmSettings>,
    denoise: Arc<Stage<Frame, Frame>>,
    background: Arc<Stage<Frame, Frame>>,
    correct: Arc<Stage<Frame, Mask>>,
    detect: Arc<Stage<Mask, Detection>>,
    tracker: Arc<PresenceTracker>,
    capture: Option<CaptureState>,
    _links: Vec<Subscription>,
}

impl Pipeline {
    pub fn build(
        options: PipelineOptions,
        source: Box<dyn CaptureSource>,
        settings: SharedSettings<AlgorithmSettings>,
        tracker: PresenceTracker,
        token: CancellationToken,
    ) -> Result<Self> {
        settings.snapshot().validate()?;

        let stage_options = |name: &str| {
            StageOptions::named(format!("{}.{}", options.camera, name))
                .with_mailbox_capacity(options.mailbox_capacity)
                .with_deadline(options.stage_deadline)
        };
        let denoise = Stage::new(
            stage_options("denoise"),
            token.clone(),
            strategy::denoise_factory(settings.clone()),
        );
        let background = Stage::new(
            stage_options("background"),
            token.clone(),
            strategy::background_factory(settings.clone()),
        );
        let correct = Stage::new(
            stage_options("correct"),
            token.clone(),
            strategy::correct_factory(settings.clone()),
        );
        let detect = Stage::new(
            stage_options("detect"),
            token.clone(),
            strategy::detect_factory(settings.clone()),
        );
        let tracker = Arc::new(tracker);

        let mut capture_config =
            CaptureConfig::from_fps(format!("{}.capture", options.camera), options.fps);
        capture_config.mailbox_capacity = options.mailbox_capacity;
        capture_config.max_frames = options.max_frames;
        let capture = CameraCaptureLoop::new(source, capture_config, token.clone());

        let links = vec![
            capture.output().subscribe(denoise.clone())?,
            denoise.subscribe(background.clone())?,
            background.subscribe(correct.clone())?,
            correct.subscribe(detect.clone())?,
            detect.subscribe(tracker.clone())?,
        ];
        log::info!(
            "{}: pipeline wired (deadline {:?}, mailbox {})",
            options.camera,
            options.stage_deadline,
            options.mailbox_capacity
        );

        Ok(Self {
            options,
            token,
            settings,
            denoise,
            background,
            correct,
            detect,
            tracker,
            capture: Some(CaptureState::Ready(capture)),
            _links: links,
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &SharedSettings<AlgorithmSettings> {
        &self.settings
    }

    /// Per-frame detections, for observers beyond the presence tracker.
    pub fn detections(&self) -> &BroadcastStream<Detection> {
        self.detect.output()
    }

    /// Spawn the capture loop. Calling it again is a no-op.
    pub fn start(&mut self) -> Result<()> {
        match self.capture.take() {
            Some(CaptureState::Ready(capture)) => {
                self.capture = Some(CaptureState::Running(capture.spawn()?));
                Ok(())
            }
            other => {
                self.capture = other;
                Ok(())
            }
        }
    }

    /// Swap in new algorithm settings. Only stages whose parameters changed are
    /// refreshed; each rebuilds on its next frame.
    pub fn apply_settings(&self, next: AlgorithmSettings) -> Result<()> {
        next.validate()?;
        let previous = self.settings.snapshot();
        let version = self.settings.replace(next.clone());

        let mut refreshed = Vec::new();
        if previous.denoise_radius != next.denoise_radius && self.denoise.refresh() {
            refreshed.push(self.denoise.name().to_string());
        }
        if previous.background_learning_rate != next.background_learning_rate
            && self.background.refresh()
        {
            refreshed.push(self.background.name().to_string());
        }
        if previous.threshold != next.threshold && self.correct.refresh() {
            refreshed.push(self.correct.name().to_string());
        }
        if previous.min_coverage != next.min_coverage && self.detect.refresh() {
            refreshed.push(self.detect.name().to_string());
        }
        log::info!(
            "{}: settings v{} applied, refreshed [{}]",
            self.options.camera,
            version,
            refreshed.join(", ")
        );
        Ok(())
    }

    /// Forget the learned background; the next frame re-seeds it.
    pub fn reset_background(&self) -> bool {
        self.background.reset()
    }

    pub fn health(&self) -> PipelineHealth {
        let frames_captured = match &self.capture {
            Some(CaptureState::Ready(capture)) => capture.frames_captured(),
            Some(CaptureState::Running(handle)) => handle.frames_captured(),
            Some(CaptureState::Finished(frames)) => *frames,
            None => 0,
        };
        PipelineHealth {
            frames_captured,
            stages: vec![
                (self.denoise.name().to_string(), self.denoise.statistics()),
                (self.background.name().to_string(), self.background.statistics()),
                (self.correct.name().to_string(), self.correct.statistics()),
                (self.detect.name().to_string(), self.detect.statistics()),
            ],
            present: self.tracker.is_present(),
            transitions: self.tracker.transitions(),
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(&self.capture, Some(CaptureState::Running(handle)) if !handle.is_finished())
    }

    /// Wait for the capture loop to end, then give in-flight frames up to `drain` to
    /// reach the tracker. Returns the capture outcome.
    pub fn wait(&mut self, drain: Duration) -> Result<()> {
        let outcome = match self.capture.take() {
            Some(CaptureState::Running(mut handle)) => {
                let outcome = handle.join();
                self.capture = Some(CaptureState::Finished(handle.frames_captured()));
                outcome
            }
            Some(CaptureState::Ready(_)) => {
                return Err(anyhow!("{}: pipeline was never started", self.options.camera))
            }
            other => {
                self.capture = other;
                Ok(())
            }
        };

        let deadline = Instant::now() + drain;
        while !self.tracker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL);
        }
        if !self.tracker.is_finished() {
            log::warn!("{}: pipeline did not drain within {:?}", self.options.camera, drain);
        }
        outcome
    }

    /// Cancel everything and wait for the capture loop.
    pub fn shutdown(&mut self, drain: Duration) -> Result<()> {
        log::info!("{}: shutting down", self.options.camera);
        self.token.cancel();
        match self.capture {
            Some(CaptureState::Running(_)) => self.wait(drain),
            _ => Ok(()),
        }
    }
}
