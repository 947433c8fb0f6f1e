//! Camera capture loop: the pipeline's producer.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::normalize::normalize_to_luma;
use super::{CaptureSource, RawFrame};
use crate::cancel::CancellationToken;
use crate::frame::Frame;
use crate::stream::{BroadcastStream, StreamOptions, DEFAULT_MAILBOX_CAPACITY};

/// The frame counter restarts at zero once it reaches this value.
pub const FRAME_COUNTER_LIMIT: u64 = u64::MAX - 1;

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub name: String,
    pub frame_interval: Duration,
    pub mailbox_capacity: usize,
    /// Stop cleanly after this many published frames.
    pub max_frames: Option<u64>,
}

impl CaptureConfig {
    pub fn from_fps(name: impl Into<String>, fps: u32) -> Self {
        Self {
            name: name.into(),
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            ..Self::default()
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            name: "capture".to_string(),
            frame_interval: Duration::from_millis(100),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_frames: None,
        }
    }
}

/// Polls a `CaptureSource` every `frame_interval` and broadcasts normalised frames.
///
/// Subscribe to `output()` before calling `run` or `spawn`. A capture failure publishes
/// `Error` then `Completed` and ends the loop; it is never retried here. Cancellation
/// is observed between iterations and during the inter-frame wait.
pub struct CameraCaptureLoop {
    source: Box<dyn CaptureSource>,
    config: CaptureConfig,
    frame_counter: u64,
    token: CancellationToken,
    output: BroadcastStream<Frame>,
    captured: Arc<AtomicU64>,
}

impl CameraCaptureLoop {
    pub fn new(
        source: Box<dyn CaptureSource>,
        config: CaptureConfig,
        token: CancellationToken,
    ) -> Self {
        let output = BroadcastStream::new(
            StreamOptions::named(config.name.clone())
                .with_mailbox_capacity(config.mailbox_capacity),
            token.clone(),
        );
        Self {
            source,
            config,
            frame_counter: 0,
            token,
            output,
            captured: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn output(&self) -> &BroadcastStream<Frame> {
        &self.output
    }

    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Run on the current thread until cancelled, `max_frames` is reached, or the
    /// source fails. Only a source failure returns `Err`.
    pub fn run(mut self) -> Result<()> {
        let name = self.config.name.clone();
        log::info!(
            "{}: capture started from {} every {:?}",
            name,
            self.source.name(),
            self.config.frame_interval
        );

        let outcome = loop {
            if self.token.is_cancelled() {
                break Ok(());
            }
            if let Some(max) = self.config.max_frames {
                if self.frames_captured() >= max {
                    log::info!("{}: captured {} frame(s), stopping", name, max);
                    break Ok(());
                }
            }

            let started = Instant::now();
            match self.source.query_frame() {
                Ok(Some(raw)) => {
                    if self.token.is_cancelled() {
                        break Ok(());
                    }
                    self.publish(raw);
                }
                Ok(None) => log::warn!("{}: no frame from {}", name, self.source.name()),
                Err(err) => {
                    log::error!("{}: capture failed, stopping: {:#}", name, err);
                    let message = format!("{}: capture failed: {:#}", name, err);
                    self.output.error(Arc::new(err));
                    self.output.complete();
                    break Err(anyhow!(message));
                }
            }

            let remaining = self
                .config
                .frame_interval
                .saturating_sub(started.elapsed());
            if self.token.wait_timeout(remaining) {
                break Ok(());
            }
        };

        // No-op if cancellation or a failure already completed the stream.
        self.output.complete();
        log::info!(
            "{}: capture stopped after {} frame(s)",
            name,
            self.frames_captured()
        );
        outcome
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<CaptureHandle> {
        let token = self.token.clone();
        let captured = self.captured.clone();
        let join = std::thread::Builder::new()
            .name(format!("capture-{}", self.config.name))
            .spawn(move || self.run())
            .map_err(|e| anyhow!("failed to spawn capture thread: {}", e))?;
        Ok(CaptureHandle {
            token,
            join: Some(join),
            captured,
        })
    }

    fn publish(&mut self, raw: RawFrame) {
        let sequence = self.frame_counter;
        self.frame_counter = next_sequence(self.frame_counter);

        let frame = normalize_to_luma(&raw.data, raw.width, raw.height, raw.format)
            .and_then(|luma| Frame::new(raw.width, raw.height, luma, sequence));
        match frame {
            Ok(frame) => {
                if self.output.next(frame) {
                    self.captured.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => log::warn!(
                "{}: skipping frame {}: {:#}",
                self.config.name,
                sequence,
                err
            ),
        }
    }
}

/// Handle to a capture loop running on its own thread.
pub struct CaptureHandle {
    token: CancellationToken,
    join: Option<JoinHandle<Result<()>>>,
    captured: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Cancel the loop's token. This also completes every stream sharing that token.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Wait for the loop to end and return its outcome. Later calls return `Ok`.
    pub fn join(&mut self) -> Result<()> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?,
            None => Ok(()),
        }
    }
}

pub(crate) fn next_sequence(counter: u64) -> u64 {
    if counter >= FRAME_COUNTER_LIMIT {
        0
    } else {
        counter + 1
    }
}
