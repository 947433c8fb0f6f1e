use anyhow::{anyhow, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::stream::broadcast::{
    BroadcastStream, Observer, StreamError, StreamOptions, Subscription,
};
use crate::stream::lock::SingleFlightLock;
use crate::stream::stats::{Statistics, StatisticsCounter};

/// Pluggable per-frame transform.
///
/// A strategy is only ever invoked by one thread at a time per stream, so it may keep
/// mutable state (a learned background model, for instance). It must tolerate being
/// dropped and rebuilt between frames.
pub trait Strategy<TIn, TOut>: Send {
    fn name(&self) -> &str;

    fn apply(&mut self, input: TIn) -> Result<TOut>;

    /// Forget accumulated state.
    fn reset(&mut self) {}
}

/// Adapts a closure into a stateless `Strategy`.
pub struct FnStrategy<F> {
    name: String,
    f: F,
}

impl<F> FnStrategy<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<TIn, TOut, F> Strategy<TIn, TOut> for FnStrategy<F>
where
    F: FnMut(TIn) -> Result<TOut> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, input: TIn) -> Result<TOut> {
        (self.f)(input)
    }
}

/// Single-flight transform stage that broadcasts its results.
///
/// `process` runs the strategy synchronously on the calling thread. If another call
/// is already transforming, the input is dropped and counted; nothing queues and the
/// caller never blocks. `reserve` claims the same slot for a transform that runs on
/// another thread. A failed transform publishes `Error` then `Completed`, after which
/// the stream ignores further input.
pub struct ProcessingStream<TIn, TOut> {
    output: BroadcastStream<TOut>,
    lock: SingleFlightLock,
    strategy: Mutex<Box<dyn Strategy<TIn, TOut>>>,
    strategy_name: String,
    counters: StatisticsCounter,
    reset_requested: AtomicBool,
    complete_pending: AtomicBool,
    abandoned: AtomicBool,
    in_flight_since: Mutex<Option<Instant>>,
}

impl<TIn, TOut> ProcessingStream<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + 'static,
{
    pub fn new(
        options: StreamOptions,
        token: CancellationToken,
        strategy: Box<dyn Strategy<TIn, TOut>>,
        counters: StatisticsCounter,
    ) -> Self {
        let strategy_name = strategy.name().to_string();
        Self {
            output: BroadcastStream::new(options, token),
            lock: SingleFlightLock::new(),
            strategy: Mutex::new(strategy),
            strategy_name,
            counters,
            reset_requested: AtomicBool::new(false),
            complete_pending: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            in_flight_since: Mutex::new(None),
        }
    }

    /// Stream with its own fresh counters.
    pub fn with_strategy<S>(options: StreamOptions, token: CancellationToken, strategy: S) -> Self
    where
        S: Strategy<TIn, TOut> + 'static,
    {
        Self::new(options, token, Box::new(strategy), StatisticsCounter::new())
    }

    pub fn name(&self) -> &str {
        self.output.name()
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn output(&self) -> &BroadcastStream<TOut> {
        &self.output
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer<TOut>>) -> Result<Subscription> {
        self.output.subscribe(observer)
    }

    pub fn statistics(&self) -> Statistics {
        self.counters.snapshot()
    }

    pub fn is_completed(&self) -> bool {
        self.output.is_completed()
    }

    /// Transform `input` and publish the result, or drop it if a transform is running.
    pub fn process(&self, input: TIn) {
        if self.is_completed() || self.output.token().is_cancelled() {
            return;
        }
        {
            let Some(_guard) = self.lock.try_guard() else {
                self.counters.record_dropped();
                log::debug!("{}: busy, frame dropped", self.name());
                return;
            };
            self.run_locked(input);
        }
        self.settle_completion();
    }

    /// Claim the single transform slot ahead of time, for a caller that hands the
    /// input to another thread. Returns `None` when busy or completed; nothing is
    /// counted, the caller decides what a refusal means.
    pub fn reserve(self: &Arc<Self>) -> Option<Reservation<TIn, TOut>> {
        if self.is_completed() || self.output.token().is_cancelled() {
            return None;
        }
        if !self.lock.try_acquire() {
            return None;
        }
        Some(Reservation {
            stream: self.clone(),
        })
    }

    /// Publish `Completed`. Later calls have no effect.
    pub fn complete(&self) -> bool {
        self.output.complete()
    }

    /// Complete once the running transform, if any, has published its result.
    ///
    /// Returns `true` when the stream completed right away and `false` when the
    /// completion was deferred to the end of the running transform.
    pub fn complete_when_idle(&self) -> bool {
        self.complete_pending.store(true, Ordering::SeqCst);
        self.settle_completion();
        !self.complete_pending.load(Ordering::SeqCst)
    }

    /// Forward an upstream error without completing.
    pub fn error(&self, error: StreamError) -> bool {
        self.output.error(error)
    }

    /// Give up on a stuck transform: publish `error`, complete the stream, and discard
    /// whatever the running transform eventually returns. Only the first call acts.
    pub fn abandon(&self, error: StreamError) -> bool {
        if self.is_completed() || self.abandoned.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.output.error(error);
        self.output.complete()
    }

    /// Ask the strategy to reset before its next transform.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// How long the current transform has been running, if one is.
    pub fn in_flight_for(&self) -> Option<Duration> {
        self.in_flight_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|since| since.elapsed())
    }

    /// Runs with the transform slot held, so results leave in transform order.
    fn run_locked(&self, input: TIn) {
        self.set_in_flight(Some(Instant::now()));
        let outcome = self.run_strategy(input);
        self.set_in_flight(None);

        match outcome {
            Ok(value) => {
                if self.output.next(value) {
                    self.counters.record_processed();
                } else {
                    self.counters.record_dropped();
                    log::debug!("{}: result discarded, stream already completed", self.name());
                }
            }
            Err(err) => {
                if self.is_completed() {
                    log::debug!("{}: late failure ignored: {:#}", self.name(), err);
                    return;
                }
                self.counters.record_error();
                log::warn!(
                    "{}: {} failed, completing stream: {:#}",
                    self.name(),
                    self.strategy_name,
                    err
                );
                self.output.error(Arc::new(err));
                self.output.complete();
            }
        }
    }

    /// Apply a deferred completion if the transform slot is free. Whoever holds the
    /// slot calls this again after releasing it, so a request is never stranded.
    fn settle_completion(&self) {
        while self.complete_pending.load(Ordering::SeqCst) {
            let Some(_guard) = self.lock.try_guard() else {
                return;
            };
            if self.complete_pending.swap(false, Ordering::SeqCst) {
                self.output.complete();
            }
        }
    }

    fn set_in_flight(&self, since: Option<Instant>) {
        *self
            .in_flight_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = since;
    }

    fn run_strategy(&self, input: TIn) -> Result<TOut> {
        let mut strategy = self
            .strategy
            .lock()
            .map_err(|_| anyhow!("{}: strategy lock poisoned", self.name()))?;
        if self.reset_requested.swap(false, Ordering::SeqCst) {
            log::info!("{}: resetting {}", self.name(), self.strategy_name);
            strategy.reset();
        }
        match catch_unwind(AssertUnwindSafe(|| strategy.apply(input))) {
            Ok(result) => result,
            Err(panic) => Err(anyhow!(
                "{} panicked: {}",
                self.strategy_name,
                panic_message(&*panic)
            )),
        }
    }
}

/// The transform slot of a `ProcessingStream`, claimed by `reserve`.
///
/// Dropping it without calling `process` frees the slot unused.
pub struct Reservation<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + 'static,
{
    stream: Arc<ProcessingStream<TIn, TOut>>,
}

impl<TIn, TOut> Reservation<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + 'static,
{
    pub fn process(self, input: TIn) {
        self.stream.run_locked(input);
    }
}

impl<TIn, TOut> Drop for Reservation<TIn, TOut>
where
    TIn: Send + 'static,
    TOut: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.stream.lock.release();
        self.stream.settle_completion();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::broadcast::Notification;
    use std::sync::mpsc::{self, Receiver, Sender};

    struct Recorder {
        tx: Mutex<Sender<Notification<u32>>>,
    }

    impl Observer<u32> for Recorder {
        fn on_next(&self, value: u32) -> Result<()> {
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

    fn subscribe(
        stream: &ProcessingStream<u32, u32>,
    ) -> Result<(Subscription, Receiver<Notification<u32>>)> {
        let (tx, rx) = mpsc::channel();
        let sub = stream.subscribe(Arc::new(Recorder { tx: Mutex::new(tx) }))?;
        Ok((sub, rx))
    }

    fn doubling() -> ProcessingStream<u32, u32> {
        ProcessingStream::with_strategy(
            StreamOptions::named("double").with_mailbox_capacity(16),
            CancellationToken::new(),
            FnStrategy::new("double", |x: u32| -> Result<u32> { Ok(x * 2) }),
        )
    }

    #[test]
    fn successful_transform_is_published_and_counted() -> Result<()> {
        let stream = doubling();
        let (_sub, rx) = subscribe(&stream)?;
        stream.process(21);

        match rx.recv_timeout(Duration::from_secs(2))? {
            Notification::Next(value) => assert_eq!(value, 42),
            _ => panic!("expected a value"),
        }
        let stats = stream.statistics();
        assert_eq!(stats.processed_frames, 1);
        assert_eq!(stats.dropped_frames, 0);
        Ok(())
    }

    #[test]
    fn panicking_strategy_becomes_error_then_completion() -> Result<()> {
        let stream: ProcessingStream<u32, u32> = ProcessingStream::with_strategy(
            StreamOptions::named("boom"),
            CancellationToken::new(),
            FnStrategy::new("boom", |_x: u32| -> Result<u32> { panic!("kaboom") }),
        );
        let (_sub, rx) = subscribe(&stream)?;
        stream.process(1);

        match rx.recv_timeout(Duration::from_secs(2))? {
            Notification::Error(err) => assert!(err.to_string().contains("kaboom")),
            _ => panic!("expected an error"),
        }
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2))?,
            Notification::Completed
        ));
        assert!(stream.is_completed());
        assert_eq!(stream.statistics().errors, 1);
        Ok(())
    }

    #[test]
    fn reset_is_applied_before_next_transform() -> Result<()> {
        struct Summing {
            total: u32,
        }
        impl Strategy<u32, u32> for Summing {
            fn name(&self) -> &str {
                "summing"
            }
            fn apply(&mut self, input: u32) -> Result<u32> {
                self.total += input;
                Ok(self.total)
            }
            fn reset(&mut self) {
                self.total = 0;
            }
        }

        let stream = ProcessingStream::with_strategy(
            StreamOptions::named("sum").with_mailbox_capacity(16),
            CancellationToken::new(),
            Summing { total: 0 },
        );
        let (_sub, rx) = subscribe(&stream)?;
        stream.process(5);
        stream.process(5);
        stream.request_reset();
        stream.process(1);

        let mut values = Vec::new();
        for _ in 0..3 {
            if let Notification::Next(value) = rx.recv_timeout(Duration::from_secs(2))? {
                values.push(value);
            }
        }
        assert_eq!(values, vec![5, 10, 1]);
        Ok(())
    }

    #[test]
    fn completion_requested_mid_transform_follows_the_result() -> Result<()> {
        let stream = Arc::new(ProcessingStream::with_strategy(
            StreamOptions::named("slow").with_mailbox_capacity(16),
            CancellationToken::new(),
            FnStrategy::new("slow", |x: u32| -> Result<u32> {
                std::thread::sleep(Duration::from_millis(100));
                Ok(x)
            }),
        ));
        let (_sub, rx) = subscribe(&stream)?;

        let reservation = stream.reserve().expect("idle stream");
        assert!(stream.reserve().is_none(), "one transform slot");
        let worker = std::thread::spawn(move || reservation.process(7));
        assert!(!stream.complete_when_idle(), "deferred while transforming");
        assert!(!stream.is_completed());
        worker.join().expect("worker");

        assert!(stream.is_completed());
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2))?,
            Notification::Next(7)
        ));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2))?,
            Notification::Completed
        ));
        assert_eq!(stream.statistics().processed_frames, 1);
        Ok(())
    }

    #[test]
    fn idle_stream_completes_immediately() {
        let stream = Arc::new(doubling());
        assert!(stream.complete_when_idle());
        assert!(stream.is_completed());
        assert!(stream.reserve().is_none());
    }

    #[test]
    fn abandon_acts_once() {
        let stream = doubling();
        let err: StreamError = Arc::new(anyhow!("stuck"));
        assert!(stream.abandon(err.clone()));
        assert!(!stream.abandon(err));
        assert!(stream.is_completed());
        stream.process(1);
        assert_eq!(stream.statistics().processed_frames, 0);
    }
}
