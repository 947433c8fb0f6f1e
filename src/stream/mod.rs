//! Broadcast + drop-on-busy stream primitives.
//!
//! - `SingleFlightLock`: non-blocking "at most one in flight" flag.
//! - `StatisticsCounter`: processed / dropped / error counters.
//! - `BroadcastStream`: fans one producer out to many independent subscribers.
//! - `ProcessingStream`: single-flight strategy application on top of a broadcast.
//!
//! Nothing in this module buffers frames for later processing. Excess work is
//! dropped and counted.

pub mod broadcast;
pub mod lock;
pub mod processing;
pub mod stats;

pub use broadcast::{
    BroadcastStream, Notification, Observer, StreamError, StreamOptions, Subscription,
    DEFAULT_MAILBOX_CAPACITY,
};
pub use lock::{SingleFlightGuard, SingleFlightLock};
pub use processing::{FnStrategy, ProcessingStream, Reservation, Strategy};
pub use stats::{Statistics, StatisticsCounter};
