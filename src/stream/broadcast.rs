//! Multi-subscriber observable.
//!
//! Every subscription owns a dispatcher thread fed by a bounded mailbox, so a slow or
//! blocked subscriber never delays the producer or its siblings. A full mailbox drops
//! `Next` and `Error` notifications for that subscriber only; `Completed` travels on a
//! separate control channel and is always delivered after whatever was queued.
//! Per-subscriber ordering follows publish order.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::cancel::{CancelRegistration, CancellationToken};

/// Error value broadcast to subscribers. Shared because every subscriber receives it.
pub type StreamError = Arc<anyhow::Error>;

/// Default number of undelivered `Next`/`Error` notifications a subscriber may have pending.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 8;

/// Subscriber side of a stream.
///
/// Handlers run on the subscription's dispatcher thread. An `Err` or a panic is
/// logged and swallowed; it never reaches the producer or other subscribers.
pub trait Observer<T>: Send + Sync {
    fn on_next(&self, value: T) -> Result<()>;

    fn on_error(&self, error: StreamError) -> Result<()>;

    fn on_completed(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum Notification<T> {
    Next(T),
    Error(StreamError),
    Completed,
}

impl<T> Notification<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Notification::Completed)
    }

    fn kind(&self) -> &'static str {
        match self {
            Notification::Next(_) => "next",
            Notification::Error(_) => "error",
            Notification::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Used in log lines and dispatcher thread names.
    pub name: String,
    pub mailbox_capacity: usize,
}

impl StreamOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Broadcasts notifications to every current subscriber.
///
/// Cloning yields another handle to the same stream. When the construction-time
/// cancellation token fires, every current subscriber receives `Completed` exactly
/// once; ordinary notifications published after cancellation are skipped.
pub struct BroadcastStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastStream<T> {
    pub fn new(options: StreamOptions, token: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            name: options.name,
            mailbox_capacity: options.mailbox_capacity.max(1),
            token: token.clone(),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            completed: AtomicBool::new(false),
            undelivered: AtomicU64::new(0),
            cancel_registration: Mutex::new(None),
        });

        // Registered after construction so an already-cancelled token can still
        // upgrade the weak handle when the callback runs immediately.
        let weak = Arc::downgrade(&shared);
        let registration = token.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                if shared.complete() {
                    log::debug!("{}: completed by cancellation", shared.name);
                }
            }
        });
        *shared
            .cancel_registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(registration);

        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock_subscribers().len()
    }

    /// `Next` and `Error` notifications dropped because a subscriber's mailbox was full.
    pub fn undelivered(&self) -> u64 {
        self.shared.undelivered.load(Ordering::Relaxed)
    }

    /// Register `observer`. Subscribing an observer that is already registered is a
    /// no-op and returns an inert handle. Subscribing to a completed stream delivers
    /// `Completed` to the observer straight away.
    pub fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Result<Subscription> {
        let shared = &self.shared;
        let mut subscribers = shared.lock_subscribers();
        if subscribers
            .iter()
            .any(|entry| same_observer(&entry.observer, &observer))
        {
            log::debug!("{}: duplicate subscription ignored", shared.name);
            return Ok(Subscription::inert());
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = spawn_dispatcher(&shared.name, id, observer.clone(), shared.mailbox_capacity)?;

        if shared.completed.load(Ordering::SeqCst) {
            mailbox.finish(Control::Complete);
            return Ok(Subscription::inert());
        }

        subscribers.push(Entry {
            id,
            observer,
            mailbox,
        });
        let count = subscribers.len();
        drop(subscribers);
        log::debug!(
            "{}: subscriber #{} added ({} active)",
            shared.name,
            id,
            count
        );

        let source: Arc<dyn Detach> = shared.clone();
        Ok(Subscription {
            id,
            source: Some(Arc::downgrade(&source)),
            active: AtomicBool::new(true),
        })
    }

    pub fn notify(&self, notification: Notification<T>) -> bool {
        match notification {
            Notification::Completed => self.shared.complete(),
            other => self.shared.publish(other),
        }
    }

    /// Publish a value. Returns `false` when the stream is completed or cancelled.
    pub fn next(&self, value: T) -> bool {
        self.shared.publish(Notification::Next(value))
    }

    /// Publish an error without completing the stream.
    pub fn error(&self, error: StreamError) -> bool {
        self.shared.publish(Notification::Error(error))
    }

    /// Deliver `Completed` to all current subscribers. Only the first call has an effect.
    pub fn complete(&self) -> bool {
        self.shared.complete()
    }
}

impl<T> std::fmt::Debug for BroadcastStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastStream")
            .field("name", &self.shared.name)
            .field("completed", &self.shared.completed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle returned by `subscribe`. Unsubscribes on drop.
///
/// Unsubscribing is idempotent and safe after the stream is gone. Once the stream has
/// completed, unsubscribing no longer cuts delivery short: the subscriber still drains
/// what was already queued, ending with `Completed`.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    id: u64,
    source: Option<Weak<dyn Detach>>,
    active: AtomicBool,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            id: 0,
            source: None,
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = self.source.as_ref().and_then(Weak::upgrade) {
            source.detach(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

struct Entry<T> {
    id: u64,
    observer: Arc<dyn Observer<T>>,
    mailbox: Mailbox<T>,
}

struct Shared<T> {
    name: String,
    mailbox_capacity: usize,
    token: CancellationToken,
    subscribers: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
    completed: AtomicBool,
    undelivered: AtomicU64,
    cancel_registration: Mutex<Option<CancelRegistration>>,
}

impl<T> Shared<T> {
    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Entry<T>>> {
        // The list stays structurally valid even if a holder panicked.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let entries = std::mem::take(&mut *self.lock_subscribers());
        log::debug!(
            "{}: completing {} subscriber(s)",
            self.name,
            entries.len()
        );
        for entry in entries {
            entry.mailbox.finish(Control::Complete);
        }
        true
    }
}

impl<T: Clone> Shared<T> {
    fn publish(&self, notification: Notification<T>) -> bool {
        if self.token.is_cancelled() || self.completed.load(Ordering::SeqCst) {
            return false;
        }
        let targets: Vec<(u64, Sender<Notification<T>>)> = self
            .lock_subscribers()
            .iter()
            .map(|entry| (entry.id, entry.mailbox.data.clone()))
            .collect();
        for (id, data) in targets {
            let mailbox_full = matches!(
                data.try_send(notification.clone()),
                Err(TrySendError::Full(_))
            );
            if mailbox_full {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "{}: subscriber #{} busy, {} dropped",
                    self.name,
                    id,
                    notification.kind()
                );
            }
        }
        true
    }
}

impl<T: Send + 'static> Detach for Shared<T> {
    fn detach(&self, id: u64) {
        let removed = {
            let mut subscribers = self.lock_subscribers();
            subscribers
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| subscribers.remove(index))
        };
        if let Some(entry) = removed {
            entry.mailbox.finish(Control::Close);
            log::debug!("{}: subscriber #{} removed", self.name, id);
        }
    }
}

fn same_observer<T>(a: &Arc<dyn Observer<T>>, b: &Arc<dyn Observer<T>>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ----------------------------------------------------------------------------
// Mailbox + dispatcher
// ----------------------------------------------------------------------------

enum Control {
    /// Drain what is queued, then deliver `Completed`.
    Complete,
    /// Unsubscribed; stop without draining.
    Close,
}

/// Producer half of a subscription.
///
/// `Next` and `Error` share the bounded data channel and are dropped when it is full.
/// The control channel carries at most one message, because an entry leaves the
/// subscriber list on completion or on detach, never both.
struct Mailbox<T> {
    data: Sender<Notification<T>>,
    control: Sender<Control>,
}

impl<T> Mailbox<T> {
    fn finish(&self, control: Control) {
        // The dispatcher is gone when this fails; nothing is left to stop.
        let _ = self.control.try_send(control);
    }
}

fn spawn_dispatcher<T: Send + 'static>(
    stream: &str,
    id: u64,
    observer: Arc<dyn Observer<T>>,
    capacity: usize,
) -> Result<Mailbox<T>> {
    let (data_tx, data) = crossbeam_channel::bounded(capacity);
    let (control_tx, control) = crossbeam_channel::bounded(1);
    let label = format!("{}#{}", stream, id);
    std::thread::Builder::new()
        .name(format!("notify-{}", label))
        .spawn(move || loop {
            crossbeam_channel::select! {
                recv(data) -> message => match message {
                    Ok(notification) => deliver(&label, observer.as_ref(), notification),
                    Err(_) => {
                        // Every sender is gone and the data channel is empty.
                        if let Ok(Control::Complete) = control.try_recv() {
                            deliver(&label, observer.as_ref(), Notification::Completed);
                        }
                        break;
                    }
                },
                recv(control) -> message => {
                    match message {
                        Ok(Control::Close) => {}
                        Ok(Control::Complete) => {
                            for notification in data.try_iter() {
                                deliver(&label, observer.as_ref(), notification);
                            }
                            deliver(&label, observer.as_ref(), Notification::Completed);
                        }
                        Err(_) => {
                            for notification in data.try_iter() {
                                deliver(&label, observer.as_ref(), notification);
                            }
                        }
                    }
                    break;
                }
            }
        })
        .map_err(|e| anyhow!("failed to spawn dispatcher for {}: {}", stream, e))?;
    Ok(Mailbox {
        data: data_tx,
        control: control_tx,
    })
}

fn deliver<T>(label: &str, observer: &dyn Observer<T>, notification: Notification<T>) {
    let kind = notification.kind();
    let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
        Notification::Next(value) => observer.on_next(value),
        Notification::Error(error) => observer.on_error(error),
        Notification::Completed => observer.on_completed(),
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("{}: subscriber failed on {}: {:#}", label, kind, err),
        Err(_) => log::warn!("{}: subscriber panicked on {}", label, kind),
    }
}
