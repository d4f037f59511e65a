pub mod memory;
#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use actix_web::rt::time::Instant;
use async_trait::async_trait;
use std::time::Duration;

/// The state of a single identifier's usage record, as observed by a [Store] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Requests counted against the identifier in its current window.
    pub count: u64,
    /// Time at which the record resets (or, for the timestamp log, when the oldest entry leaves
    /// the window).
    pub reset: Instant,
}

impl Snapshot {
    pub(crate) fn empty(reset: Instant) -> Self {
        Self { count: 0, reset }
    }
}

/// Upper bound on the lifetime of a record, windows longer than this are treated as this long.
pub const MAX_WINDOW: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant one `window` after `start`, saturating at [MAX_WINDOW].
pub(crate) fn deadline(start: Instant, window: Duration) -> Instant {
    start + window.min(MAX_WINDOW)
}

/// Persists per-identifier usage state and handles its expiry.
///
/// Every operation that changes a record is atomic with respect to other callers using the same
/// identifier; concurrent requests never lose or double count an increment.
///
/// A Store is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection pools already do so internally; there is no
/// need to wrap it twice.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Add `amount` to the counter for `key`, creating it if absent, and return the new count.
    ///
    /// `window` is the lifetime given to a newly created record.
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<Snapshot, Self::Error>;

    /// Add one to the counter for `key` only if its current count is below `max`.
    ///
    /// Returns whether the increment happened, and the count after the operation.
    async fn increment_below(
        &self,
        key: &str,
        max: u64,
        window: Duration,
    ) -> Result<(bool, Snapshot), Self::Error>;

    /// Read the counter for `key`; absent or expired records read as zero.
    async fn get(&self, key: &str) -> Result<Snapshot, Self::Error>;

    /// Subtract one from the counter for `key`, saturating at zero.
    async fn decrement(&self, key: &str) -> Result<(), Self::Error>;

    /// Drop timestamps older than `window` from the log for `key`, then append the current time
    /// if fewer than `max` remain.
    ///
    /// Returns whether the timestamp was appended, and the number of timestamps in the window
    /// after the operation.
    async fn append_within(
        &self,
        key: &str,
        max: u64,
        window: Duration,
    ) -> Result<(bool, Snapshot), Self::Error>;

    /// Count the timestamps for `key` that lie within the trailing `window`.
    async fn get_log(&self, key: &str, window: Duration) -> Result<Snapshot, Self::Error>;

    /// Removes all state for a given identifier.
    async fn reset_key(&self, key: &str) -> Result<(), Self::Error>;

    /// Removes the state of every identifier held by this store.
    async fn reset_all(&self) -> Result<(), Self::Error>;

    /// The window every record of this store rolls over with, if the store does not support a
    /// window per record.
    ///
    /// Counters created with a different window still expire on their own.
    fn shared_window(&self) -> Option<Duration> {
        None
    }

    /// Stop background tasks and release connections.
    ///
    /// Calling this more than once has no further effect. Any later operation fails.
    async fn close(&self) -> Result<(), Self::Error>;
}
