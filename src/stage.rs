//! Long-lived pipeline stage over a replaceable `ProcessingStream`.
//!
//! A `Stage` is an `Observer` of its input type, so stages chain by subscribing one
//! to the previous stage's `output()`. The inner stream is rebuilt from the strategy
//! factory whenever it is missing or completed; the rebuild happens on the next
//! incoming frame, never mid-frame. Subscribers attach to the stage's own output,
//! which survives every rebuild.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::stream::{
    BroadcastStream, Observer, ProcessingStream, SingleFlightLock, Statistics,
    StatisticsCounter, Strategy, StreamError, StreamOptions, Subscription,
    DEFAULT_MAILBOX_CAPACITY,
};

/// Builds a fresh strategy from whatever settings are current when it is called.
pub type StrategyFactory<TIn, TOut> =
    Box<dyn Fn() -> Result<Box<dyn Strategy<TIn, TOut>>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct StageOptions {
    pub name: String,
    pub mailbox_capacity: usize,
    /// Abandon a transform that runs longer than this. `None` waits forever.
    pub deadline: Option<Duration>,
}

impl StageOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            deadline: None,
        }
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Published on `Stage::configuration_changes` after every inner stream rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationChanged {
    pub stage: String,
    pub generation: u64,
    pub strategy: String,
}

/// Error published when a stage abandons a transform that overran its deadline.
#[derive(Debug, Clone)]
pub struct DeadlineExceeded {
    pub stage: String,
    pub strategy: String,
    pub elapsed: Duration,
    pub deadline: Duration,
}

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} exceeded its {:?} deadline (running for {:?})",
            self.stage, self.strategy, self.deadline, self.elapsed
        )
    }
}

impl std::error::Error for DeadlineExceeded {}

struct Generation<TIn, TOut> {
    id: u64,
    stream: Arc<ProcessingStream<TIn, TOut>>,
    _forward: Subscription,
}

pub struct Stage<TIn, TOut> {
    options: StageOptions,
    token: CancellationToken,
    factory: StrategyFactory<TIn, TOut>,
    counters: StatisticsCounter,
    // Swapped for a fresh lock when a stuck transform is abandoned; the stuck
    // worker still releases the lock it acquired.
    dispatch: Mutex<Arc<SingleFlightLock>>,
    current: Mutex<Option<Generation<TIn, TOut>>>,
    generations: AtomicU64,
    output: BroadcastStream<TOut>,
    changes: BroadcastStream<ConfigurationChanged>,
    upstream_done: Arc<AtomicBool>,
}

impl<TIn, TOut> Stage<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + 'static,
{
    pub fn new<F>(options: StageOptions, token: CancellationToken, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<Box<dyn Strategy<TIn, TOut>>> + Send + Sync + 'static,
    {
        let output = BroadcastStream::new(
            StreamOptions::named(options.name.clone())
                .with_mailbox_capacity(options.mailbox_capacity),
            token.clone(),
        );
        let changes = BroadcastStream::new(
            StreamOptions::named(format!("{}-config", options.name)),
            token.clone(),
        );
        Arc::new(Self {
            options,
            token,
            factory: Box::new(factory),
            counters: StatisticsCounter::new(),
            dispatch: Mutex::new(Arc::new(SingleFlightLock::new())),
            current: Mutex::new(None),
            generations: AtomicU64::new(0),
            output,
            changes,
            upstream_done: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Stable output: survives inner stream rebuilds.
    pub fn output(&self) -> &BroadcastStream<TOut> {
        &self.output
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer<TOut>>) -> Result<Subscription> {
        self.output.subscribe(observer)
    }

    pub fn configuration_changes(&self) -> &BroadcastStream<ConfigurationChanged> {
        &self.changes
    }

    /// Counters accumulated across every inner stream this stage has built.
    pub fn statistics(&self) -> Statistics {
        self.counters.snapshot()
    }

    /// Id of the current inner stream, `0` before the first frame.
    pub fn generation(&self) -> u64 {
        self.lock_current().as_ref().map_or(0, |generation| generation.id)
    }

    /// Complete the current inner stream so the next frame rebuilds it from the
    /// factory. A transform already running finishes and publishes first; the
    /// completion follows it. Returns `false` when there is no live stream.
    pub fn refresh(&self) -> bool {
        match self.live_stream() {
            Some(stream) => {
                if stream.complete_when_idle() {
                    log::info!("{}: refreshed", self.options.name);
                } else {
                    log::info!(
                        "{}: refresh deferred until the running transform publishes",
                        self.options.name
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Reset accumulated strategy state before the next transform. Counters are kept.
    pub fn reset(&self) -> bool {
        match self.live_stream() {
            Some(stream) => {
                stream.request_reset();
                true
            }
            None => false,
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Generation<TIn, TOut>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch_lock(&self) -> Arc<SingleFlightLock> {
        self.dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn live_stream(&self) -> Option<Arc<ProcessingStream<TIn, TOut>>> {
        self.lock_current()
            .as_ref()
            .filter(|generation| !generation.stream.is_completed())
            .map(|generation| generation.stream.clone())
    }

    fn ensure_stream(&self) -> Result<Arc<ProcessingStream<TIn, TOut>>> {
        let mut current = self.lock_current();
        if let Some(generation) = current.as_ref() {
            if !generation.stream.is_completed() {
                return Ok(generation.stream.clone());
            }
        }

        let previous = current.take();
        if let Some(previous) = previous.as_ref() {
            previous.stream.complete();
        }

        let strategy = (self.factory)()
            .map_err(|e| anyhow!("{}: strategy factory failed: {:#}", self.options.name, e))?;
        let id = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let stream = Arc::new(ProcessingStream::new(
            StreamOptions::named(format!("{}.{}", self.options.name, id))
                .with_mailbox_capacity(self.options.mailbox_capacity),
            self.token.clone(),
            strategy,
            self.counters.clone(),
        ));
        let forward = stream.subscribe(Arc::new(Forwarder {
            stage: self.options.name.clone(),
            output: self.output.clone(),
            upstream_done: self.upstream_done.clone(),
        }))?;
        let strategy_name = stream.strategy_name().to_string();
        *current = Some(Generation {
            id,
            stream: stream.clone(),
            _forward: forward,
        });
        drop(current);
        drop(previous);

        log::info!(
            "{}: built stream #{} with {}",
            self.options.name,
            id,
            strategy_name
        );
        self.changes.next(ConfigurationChanged {
            stage: self.options.name.clone(),
            generation: id,
            strategy: strategy_name,
        });
        Ok(stream)
    }

    fn enforce_deadline(&self) {
        let Some(deadline) = self.options.deadline else {
            return;
        };
        let Some(stream) = self.live_stream() else {
            return;
        };
        let Some(elapsed) = stream.in_flight_for() else {
            return;
        };
        if elapsed <= deadline {
            return;
        }
        let overrun = DeadlineExceeded {
            stage: self.options.name.clone(),
            strategy: stream.strategy_name().to_string(),
            elapsed,
            deadline,
        };
        let message = overrun.to_string();
        if stream.abandon(Arc::new(anyhow::Error::new(overrun))) {
            self.counters.record_error();
            *self
                .dispatch
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                Arc::new(SingleFlightLock::new());
            log::warn!("{}; stream abandoned", message);
        }
    }
}

impl<TIn, TOut> Observer<TIn> for Stage<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + 'static,
{
    /// Accept the frame if the stage is idle, otherwise drop it.
    ///
    /// An accepted frame is transformed on a worker thread; the stage stays busy
    /// until that transform has published its result.
    fn on_next(&self, value: TIn) -> Result<()> {
        if self.token.is_cancelled() || self.upstream_done.load(Ordering::SeqCst) {
            return Ok(());
        }
        let lock = self.dispatch_lock();
        if !lock.try_acquire() {
            self.counters.record_dropped();
            log::debug!("{}: busy, frame dropped", self.options.name);
            self.enforce_deadline();
            return Ok(());
        }

        let stream = match self.ensure_stream() {
            Ok(stream) => stream,
            Err(err) => {
                lock.release();
                self.counters.record_error();
                log::warn!("{:#}", err);
                return Ok(());
            }
        };

        // Claimed before the worker starts so a completion requested in between
        // waits for this frame instead of overtaking it.
        let Some(reservation) = stream.reserve() else {
            lock.release();
            self.counters.record_dropped();
            log::debug!("{}: stream closing, frame dropped", self.options.name);
            return Ok(());
        };

        let worker_lock = lock.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("stage-{}", self.options.name))
            .spawn(move || {
                reservation.process(value);
                worker_lock.release();
            });
        if let Err(err) = spawned {
            lock.release();
            self.counters.record_error();
            return Err(anyhow!(
                "{}: failed to spawn transform worker: {}",
                self.options.name,
                err
            ));
        }
        Ok(())
    }

    fn on_error(&self, error: StreamError) -> Result<()> {
        match self.live_stream() {
            Some(stream) => {
                stream.error(error);
            }
            None => {
                self.output.error(error);
            }
        }
        Ok(())
    }

    /// The inner stream completes after any frame it already accepted; the
    /// forwarder then completes the stage output.
    fn on_completed(&self) -> Result<()> {
        self.upstream_done.store(true, Ordering::SeqCst);
        match self.live_stream() {
            Some(stream) => {
                stream.complete_when_idle();
            }
            None => {
                self.output.complete();
            }
        }
        log::info!("{}: upstream completed", self.options.name);
        Ok(())
    }
}

/// Pipes one inner stream into the stage output.
///
/// Inner completion only completes the stage output once upstream has completed;
/// otherwise the stage rebuilds on its next frame.
struct Forwarder<T> {
    stage: String,
    output: BroadcastStream<T>,
    upstream_done: Arc<AtomicBool>,
}

impl<T: Clone + Send + 'static> Observer<T> for Forwarder<T> {
    fn on_next(&self, value: T) -> Result<()> {
        self.output.next(value);
        Ok(())
    }

    fn on_error(&self, error: StreamError) -> Result<()> {
        self.output.error(error);
        Ok(())
    }

    fn on_completed(&self) -> Result<()> {
        if self.upstream_done.load(Ordering::SeqCst) {
            self.output.complete();
        } else {
            log::debug!(
                "{}: inner stream completed, next frame rebuilds",
                self.stage
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FnStrategy, Notification};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::time::Instant;

    struct Recorder<T> {
        tx: Mutex<Sender<Notification<T>>>,
    }

    impl<T: Send + 'static> Observer<T> for Recorder<T> {
        fn on_next(&self, value: T) -> Result<()> {
            let _ = self.tx.lock().unwrap().send(Notification::Next(value));
            Ok(())
        }

        fn on_error(&self, error: StreamError) -> Result<()> {
            let _ = self.tx.lock().unwrap().send(Notification::Error(error));
            Ok(())
        }

        fn on_completed(&self) -> Result<()> {
            let _ = self.tx.lock().unwrap().send(Notification::Completed);
            Ok(())
        }
    }

    fn recorder<T: Send + 'static>() -> (Arc<Recorder<T>>, Receiver<Notification<T>>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Recorder { tx: Mutex::new(tx) }), rx)
    }

    fn next_value<T>(rx: &Receiver<Notification<T>>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(Notification::Next(value)) => return Some(value),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn wait_idle<TIn, TOut>(stage: &Stage<TIn, TOut>)
    where
        TIn: Send + 'static,
        TOut: Clone + Send + 'static,
    {
        let deadline = Instant::now() + Duration::from_secs(2);
        while stage.dispatch_lock().is_busy() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn offset_stage(offset: Arc<AtomicU64>) -> Arc<Stage<u64, u64>> {
        slow_offset_stage(offset, Duration::ZERO)
    }

    fn slow_offset_stage(offset: Arc<AtomicU64>, pause: Duration) -> Arc<Stage<u64, u64>> {
        Stage::new(
            StageOptions::named("offset"),
            CancellationToken::new(),
            move || {
                let add = offset.load(Ordering::SeqCst);
                Ok(Box::new(FnStrategy::new(
                    format!("add{}", add),
                    move |x: u64| -> Result<u64> {
                        std::thread::sleep(pause);
                        Ok(x + add)
                    },
                )) as Box<dyn Strategy<u64, u64>>)
            },
        )
    }

    fn until_completed<T>(rx: &Receiver<Notification<T>>) -> Vec<Notification<T>> {
        let mut seen = Vec::new();
        while let Ok(notification) = rx.recv_timeout(Duration::from_secs(2)) {
            let terminal = notification.is_terminal();
            seen.push(notification);
            if terminal {
                break;
            }
        }
        seen
    }

    #[test]
    fn rebuild_picks_up_current_settings() -> Result<()> {
        let offset = Arc::new(AtomicU64::new(10));
        let stage = offset_stage(offset.clone());
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(1)?;
        assert_eq!(next_value(&rx), Some(11));
        wait_idle(&stage);

        offset.store(100, Ordering::SeqCst);
        stage.on_next(1)?;
        assert_eq!(next_value(&rx), Some(11), "settings apply only after a rebuild");
        wait_idle(&stage);

        assert!(stage.refresh());
        stage.on_next(1)?;
        assert_eq!(next_value(&rx), Some(101));
        assert_eq!(stage.generation(), 2);
        Ok(())
    }

    #[test]
    fn busy_stage_drops_frames() -> Result<()> {
        let stage: Arc<Stage<u64, u64>> = Stage::new(
            StageOptions::named("slow"),
            CancellationToken::new(),
            || {
                Ok(Box::new(FnStrategy::new("sleepy", |x: u64| -> Result<u64> {
                    std::thread::sleep(Duration::from_millis(150));
                    Ok(x)
                })) as Box<dyn Strategy<u64, u64>>)
            },
        );
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(1)?;
        stage.on_next(2)?;
        stage.on_next(3)?;
        assert_eq!(next_value(&rx), Some(1));
        wait_idle(&stage);

        let stats = stage.statistics();
        assert_eq!(stats.processed_frames, 1);
        assert_eq!(stats.dropped_frames, 2);
        Ok(())
    }

    #[test]
    fn failed_transform_self_heals_on_next_frame() -> Result<()> {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let stage: Arc<Stage<u64, u64>> = Stage::new(
            StageOptions::named("flaky"),
            CancellationToken::new(),
            move || {
                let seen = seen.clone();
                Ok(Box::new(FnStrategy::new("flaky", move |x: u64| -> Result<u64> {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(anyhow!("first call fails"))
                    } else {
                        Ok(x)
                    }
                })) as Box<dyn Strategy<u64, u64>>)
            },
        );
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(1)?;
        match rx.recv_timeout(Duration::from_secs(2))? {
            Notification::Error(err) => assert!(err.to_string().contains("first call fails")),
            _ => panic!("expected the transform error"),
        }
        wait_idle(&stage);

        stage.on_next(2)?;
        assert_eq!(next_value(&rx), Some(2));
        assert_eq!(stage.generation(), 2);
        assert_eq!(stage.statistics().errors, 1);
        assert!(!stage.output().is_completed());
        Ok(())
    }

    #[test]
    fn upstream_completion_completes_output_once() -> Result<()> {
        let stage = offset_stage(Arc::new(AtomicU64::new(0)));
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(5)?;
        assert_eq!(next_value(&rx), Some(5));
        wait_idle(&stage);
        stage.on_completed()?;
        stage.on_completed()?;

        let mut completions = 0;
        while let Ok(notification) = rx.recv_timeout(Duration::from_millis(300)) {
            if notification.is_terminal() {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        Ok(())
    }

    #[test]
    fn upstream_completion_waits_for_accepted_frame() -> Result<()> {
        let stage = slow_offset_stage(Arc::new(AtomicU64::new(0)), Duration::from_millis(100));
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(7)?;
        stage.on_completed()?;

        let seen = until_completed(&rx);
        assert_eq!(seen.len(), 2, "{:?}", seen);
        assert!(matches!(seen[0], Notification::Next(7)));
        assert!(matches!(seen[1], Notification::Completed));
        assert_eq!(stage.statistics().processed_frames, 1);
        assert_eq!(stage.statistics().dropped_frames, 0);
        Ok(())
    }

    #[test]
    fn refresh_lets_the_running_transform_publish() -> Result<()> {
        let offset = Arc::new(AtomicU64::new(1));
        let stage = slow_offset_stage(offset.clone(), Duration::from_millis(100));
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(9)?;
        std::thread::sleep(Duration::from_millis(20));
        offset.store(50, Ordering::SeqCst);
        assert!(stage.refresh());
        assert_eq!(next_value(&rx), Some(10));
        wait_idle(&stage);
        assert_eq!(stage.statistics().processed_frames, 1);
        assert_eq!(stage.generation(), 1);

        stage.on_next(9)?;
        assert_eq!(next_value(&rx), Some(59));
        assert_eq!(stage.generation(), 2);
        assert!(!stage.output().is_completed());
        Ok(())
    }

    #[test]
    fn upstream_error_during_transform_keeps_the_frame() -> Result<()> {
        let stage = slow_offset_stage(Arc::new(AtomicU64::new(0)), Duration::from_millis(100));
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(4)?;
        stage.on_error(Arc::new(anyhow!("camera hiccup")))?;

        let mut errors = 0;
        let mut values = Vec::new();
        while let Ok(notification) = rx.recv_timeout(Duration::from_millis(400)) {
            match notification {
                Notification::Next(value) => values.push(value),
                Notification::Error(_) => errors += 1,
                Notification::Completed => panic!("an upstream error does not complete the stage"),
            }
        }
        assert_eq!((errors, values), (1, vec![4]));
        assert_eq!(stage.statistics().processed_frames, 1);
        Ok(())
    }

    #[test]
    fn rebuild_announces_configuration_change() -> Result<()> {
        let stage = offset_stage(Arc::new(AtomicU64::new(3)));
        let (rec, rx) = recorder::<ConfigurationChanged>();
        let _sub = stage.configuration_changes().subscribe(rec)?;

        stage.on_next(1)?;
        let change = next_value(&rx).expect("configuration change");
        assert_eq!(change.stage, "offset");
        assert_eq!(change.generation, 1);
        assert_eq!(change.strategy, "add3");
        Ok(())
    }

    #[test]
    fn stuck_transform_is_abandoned_after_deadline() -> Result<()> {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let stage: Arc<Stage<u64, u64>> = Stage::new(
            StageOptions::named("stuck").with_deadline(Some(Duration::from_millis(50))),
            CancellationToken::new(),
            move || {
                let seen = seen.clone();
                Ok(Box::new(FnStrategy::new("stuck", move |x: u64| -> Result<u64> {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        std::thread::sleep(Duration::from_millis(400));
                    }
                    Ok(x)
                })) as Box<dyn Strategy<u64, u64>>)
            },
        );
        let (rec, rx) = recorder();
        let _sub = stage.subscribe(rec)?;

        stage.on_next(1)?;
        std::thread::sleep(Duration::from_millis(120));
        stage.on_next(2)?; // detects the overrun and is itself dropped
        match rx.recv_timeout(Duration::from_secs(2))? {
            Notification::Error(err) => assert!(err.downcast_ref::<DeadlineExceeded>().is_some()),
            _ => panic!("expected a deadline error"),
        }

        stage.on_next(3)?;
        assert_eq!(next_value(&rx), Some(3));
        assert_eq!(stage.generation(), 2);
        Ok(())
    }
}
