//! Presence decisions: the terminal observer of the pipeline.
//!
//! `PresenceTracker` debounces per-frame detections into occupied/clear transitions and
//! hands each transition to its sinks. A sink failure is logged and never stops the
//! tracker or the other sinks.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::frame::{BoundingBox, Detection};
use crate::stream::{Observer, StreamError};

pub const DEFAULT_HOLD_FRAMES: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PresenceEvent {
    pub camera: String,
    pub present: bool,
    pub coverage: f32,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    /// Capture-to-decision latency of the frame that caused the transition.
    pub latency_ms: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

pub trait PresenceSink: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, event: &PresenceEvent) -> Result<()>;

    /// Called once when the detection stream ends.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes transitions to the log.
pub struct LogSink;

impl PresenceSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, event: &PresenceEvent) -> Result<()> {
        log::info!(
            "{}: {} (coverage {:.3}, frame {}, {} ms)",
            event.camera,
            if event.present { "occupied" } else { "clear" },
            event.coverage,
            event.sequence,
            event.latency_ms
        );
        Ok(())
    }
}

#[derive(Default)]
struct TrackerState {
    present: bool,
    streak: u32,
    last: Option<PresenceEvent>,
}

pub struct PresenceTracker {
    camera: String,
    hold_frames: u32,
    state: Mutex<TrackerState>,
    sinks: Vec<Arc<dyn PresenceSink>>,
    transitions: AtomicU64,
    finished: AtomicBool,
}

impl PresenceTracker {
    /// A state change needs `hold_frames` consecutive detections that disagree with the
    /// current state.
    pub fn new(camera: impl Into<String>, hold_frames: u32) -> Self {
        Self {
            camera: camera.into(),
            hold_frames: hold_frames.max(1),
            state: Mutex::new(TrackerState::default()),
            sinks: Vec::new(),
            transitions: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PresenceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_present(&self) -> bool {
        self.lock_state().present
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// The detection stream has completed and the sinks are closed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn last_event(&self) -> Option<PresenceEvent> {
        self.lock_state().last.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one detection into the debounced state. Returns the transition, if any.
    pub fn observe(&self, detection: &Detection) -> Option<PresenceEvent> {
        let mut state = self.lock_state();
        if detection.present == state.present {
            state.streak = 0;
            return None;
        }
        state.streak += 1;
        if state.streak < self.hold_frames {
            return None;
        }
        state.present = detection.present;
        state.streak = 0;
        let event = PresenceEvent {
            camera: self.camera.clone(),
            present: detection.present,
            coverage: detection.coverage,
            sequence: detection.sequence,
            bounding_box: detection.bounding_box,
            latency_ms: detection.captured_at.elapsed().as_millis() as u64,
            timestamp: unix_now(),
        };
        state.last = Some(event.clone());
        self.transitions.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }
}

impl Observer<Detection> for PresenceTracker {
    fn on_next(&self, detection: Detection) -> Result<()> {
        let Some(event) = self.observe(&detection) else {
            return Ok(());
        };
        for sink in &self.sinks {
            if let Err(err) = sink.publish(&event) {
                log::warn!("{}: {} sink failed: {:#}", self.camera, sink.name(), err);
            }
        }
        Ok(())
    }

    fn on_error(&self, error: StreamError) -> Result<()> {
        log::warn!("{}: detection error: {:#}", self.camera, error);
        Ok(())
    }

    fn on_completed(&self) -> Result<()> {
        log::info!(
            "{}: detections ended after {} transition(s)",
            self.camera,
            self.transitions()
        );
        for sink in &self.sinks {
            if let Err(err) = sink.close() {
                log::warn!("{}: closing {} sink failed: {:#}", self.camera, sink.name(), err);
            }
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
