//! Presence pipeline
//!
//! Camera frames flow through a chain of independently swappable stages
//! (denoise → subtract background → correct → detect) until a presence decision is made.
//!
//! # Architecture
//!
//! The stages sit on a small broadcast + backpressure framework:
//!
//! 1. **Fan-out without head-of-line blocking**: every subscriber has its own dispatcher
//!    and bounded mailbox, so a slow consumer never delays the producer or its siblings.
//! 2. **Process or drop**: at most one transform runs per stage; frames that arrive
//!    while it is busy are dropped and counted, never queued.
//! 3. **Hot swap between frames**: a stage rebuilds its strategy from current settings
//!    on the frame after its stream completes. Work already running is not interrupted.
//! 4. **Terminal events exactly once**: completion and cancellation reach each
//!    subscriber once, on every branch.
//!
//! # Module Structure
//!
//! - `stream`: `BroadcastStream`, `ProcessingStream`, `SingleFlightLock`, statistics
//! - `stage`: `Stage`, the long-lived chainable façade over a replaceable stream
//! - `ingest`: capture sources and the `CameraCaptureLoop` producer
//! - `strategy`: reference image strategies
//! - `presence`, `transport`: presence decisions and their delivery
//! - `pipeline`, `config`: wiring for the `presenced` daemon

pub mod cancel;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod presence;
pub mod settings;
pub mod stage;
pub mod strategy;
pub mod stream;
pub mod transport;

pub use cancel::{CancelRegistration, CancellationToken};
pub use frame::{BoundingBox, Detection, Frame, Mask};
pub use ingest::{
    open_source, CameraCaptureLoop, CaptureConfig, CaptureHandle, CaptureSource, RawFrame,
};
pub use pipeline::{Pipeline, PipelineHealth, PipelineOptions};
pub use presence::{LogSink, PresenceEvent, PresenceSink, PresenceTracker};
pub use settings::{AlgorithmSettings, SharedSettings};
pub use stage::{ConfigurationChanged, DeadlineExceeded, Stage, StageOptions, StrategyFactory};
pub use stream::{
    BroadcastStream, FnStrategy, Notification, Observer, ProcessingStream, SingleFlightLock,
    Statistics, StatisticsCounter, Strategy, StreamError, StreamOptions, Subscription,
};
