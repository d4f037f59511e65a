use crate::store::{deadline, Snapshot, Store, MAX_WINDOW};
use actix_web::http::StatusCode;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use actix_web::ResponseError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("The in-memory store has been closed")]
    Closed,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// How the windows of the records held by an [InMemoryStore] roll over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Each record expires one window after the first request that created it.
    PerKey,
    /// All records share a single window, a timer clears the whole table every time it elapses.
    ///
    /// Identifiers are reset in lockstep rather than one window after their own first request.
    /// Counters created with any other window (such as a throttle) keep their own expiry.
    Shared(Duration),
}

/// A [Store] that uses [Dashmap](dashmap::DashMap) to keep usage records in process memory.
///
/// Locking is per shard of the map, so requests for unrelated identifiers do not serialize
/// behind each other.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<State>,
    task: Arc<TaskGuard>,
}

struct State {
    counters: DashMap<String, Counter>,
    logs: DashMap<String, Log>,
    mode: WindowMode,
    anchor: Instant,
    // Milliseconds after `anchor` at which the shared window resets.
    shared_reset_ms: AtomicU64,
    closed: AtomicBool,
}

struct Counter {
    count: u64,
    expires: Instant,
}

struct Log {
    stamps: VecDeque<Instant>,
    window: Duration,
}

impl Log {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if deadline(*oldest, self.window) > now {
                break;
            }
            self.stamps.pop_front();
        }
    }

    fn snapshot(&self, now: Instant) -> Snapshot {
        Snapshot {
            count: self.stamps.len() as u64,
            reset: self
                .stamps
                .front()
                .map_or(now, |oldest| deadline(*oldest, self.window)),
        }
    }
}

// Aborts the background task once the last store handle is dropped.
struct TaskGuard {
    handle: Option<JoinHandle<()>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl State {
    // The shared reset instant as last stored by the timer.
    fn stored_reset(&self) -> Instant {
        self.anchor + Duration::from_millis(self.shared_reset_ms.load(Ordering::Acquire))
    }

    fn shared_reset(&self, window: Duration, now: Instant) -> Instant {
        let reset = self.stored_reset();
        if reset > now {
            return reset;
        }
        // The timer has not caught up yet, project forward to the next boundary
        let window_ms = window.min(MAX_WINDOW).as_millis().max(1);
        let periods = (now - reset).as_millis() / window_ms + 1;
        reset + Duration::from_millis((window_ms * periods) as u64)
    }

    // Drops every record of the elapsed shared window and stores the next boundary.
    fn roll_over(&self, window: Duration) {
        let now = Instant::now();
        self.counters.retain(|_k, v| v.expires > now);
        self.logs.clear();
        let next = self.shared_reset(window, now);
        let offset = next.saturating_duration_since(self.anchor);
        self.shared_reset_ms.store(offset.as_millis() as u64, Ordering::Release);
    }

    // Expiry given to a record that is created (or restarted) at `now`.
    fn expiry(&self, now: Instant, window: Duration) -> Instant {
        match self.mode {
            WindowMode::Shared(shared) if shared == window => self.shared_reset(shared, now),
            _ => deadline(now, window),
        }
    }

    // Reset reported for identifiers that have no live record.
    fn idle_reset(&self, now: Instant) -> Instant {
        match self.mode {
            WindowMode::PerKey => now,
            WindowMode::Shared(shared) => self.shared_reset(shared, now),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl InMemoryStore {
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            mode: WindowMode::PerKey,
        }
    }

    pub fn mode(&self) -> WindowMode {
        self.state.mode
    }

    fn garbage_collector(state: Arc<State>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                state.counters.retain(|_k, v| v.expires > now);
                state.logs.retain(|_k, v| {
                    v.stamps
                        .back()
                        .map_or(false, |newest| deadline(*newest, v.window) > now)
                });
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }

    fn reset_timer(state: Arc<State>, window: Duration) -> JoinHandle<()> {
        actix_web::rt::spawn(async move {
            loop {
                // Completes at once if the boundary passed before this task was polled
                actix_web::rt::time::sleep_until(state.stored_reset()).await;
                if state.closed.load(Ordering::Acquire) {
                    break;
                }
                log::trace!("Shared rate limit window elapsed, clearing all records");
                state.roll_over(window);
            }
        })
    }

    #[cfg(test)]
    fn contains_counter(&self, key: &str) -> bool {
        self.state.counters.contains_key(key)
    }

    #[cfg(test)]
    fn contains_log(&self, key: &str) -> bool {
        self.state.logs.contains_key(key)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Error = Error;

    async fn increment(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<Snapshot, Self::Error> {
        self.state.ensure_open()?;
        let now = Instant::now();
        let expiry = self.state.expiry(now, window);
        let mut counter = self
            .state
            .counters
            .entry(key.to_owned())
            .or_insert(Counter {
                count: 0,
                expires: expiry,
            });
        // If this record has expired, restart it with a new TTL
        if counter.expires <= now {
            counter.count = 0;
            counter.expires = expiry;
        }
        counter.count = counter.count.saturating_add(amount);
        Ok(Snapshot {
            count: counter.count,
            reset: counter.expires,
        })
    }

    async fn increment_below(
        &self,
        key: &str,
        max: u64,
        window: Duration,
    ) -> Result<(bool, Snapshot), Self::Error> {
        self.state.ensure_open()?;
        let now = Instant::now();
        let expiry = self.state.expiry(now, window);
        let mut counter = self
            .state
            .counters
            .entry(key.to_owned())
            .or_insert(Counter {
                count: 0,
                expires: expiry,
            });
        if counter.expires <= now {
            counter.count = 0;
            counter.expires = expiry;
        }
        let admitted = counter.count < max;
        if admitted {
            counter.count += 1;
        }
        Ok((
            admitted,
            Snapshot {
                count: counter.count,
                reset: counter.expires,
            },
        ))
    }

    async fn get(&self, key: &str) -> Result<Snapshot, Self::Error> {
        self.state.ensure_open()?;
        let now = Instant::now();
        Ok(match self.state.counters.get(key) {
            Some(counter) if counter.expires > now => Snapshot {
                count: counter.count,
                reset: counter.expires,
            },
            _ => Snapshot::empty(self.state.idle_reset(now)),
        })
    }

    async fn decrement(&self, key: &str) -> Result<(), Self::Error> {
        self.state.ensure_open()?;
        if let Some(mut counter) = self.state.counters.get_mut(key) {
            counter.count = counter.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn append_within(
        &self,
        key: &str,
        max: u64,
        window: Duration,
    ) -> Result<(bool, Snapshot), Self::Error> {
        self.state.ensure_open()?;
        let now = Instant::now();
        let mut log = self.state.logs.entry(key.to_owned()).or_insert_with(|| Log {
            stamps: VecDeque::new(),
            window,
        });
        log.window = window;
        log.prune(now);
        let admitted = (log.stamps.len() as u64) < max;
        if admitted {
            log.stamps.push_back(now);
        }
        Ok((admitted, log.snapshot(now)))
    }

    async fn get_log(&self, key: &str, window: Duration) -> Result<Snapshot, Self::Error> {
        self.state.ensure_open()?;
        let now = Instant::now();
        let Some(log) = self.state.logs.get(key) else {
            return Ok(Snapshot::empty(now));
        };
        let mut live = log
            .stamps
            .iter()
            .filter(|stamp| deadline(**stamp, window) > now)
            .peekable();
        let reset = live.peek().map_or(now, |oldest| deadline(**oldest, window));
        Ok(Snapshot {
            count: live.count() as u64,
            reset,
        })
    }

    async fn reset_key(&self, key: &str) -> Result<(), Self::Error> {
        self.state.ensure_open()?;
        self.state.counters.remove(key);
        self.state.logs.remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), Self::Error> {
        self.state.ensure_open()?;
        self.state.counters.clear();
        self.state.logs.clear();
        Ok(())
    }

    fn shared_window(&self) -> Option<Duration> {
        match self.state.mode {
            WindowMode::PerKey => None,
            WindowMode::Shared(window) => Some(window),
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            if let Some(handle) = &self.task.handle {
                handle.abort();
            }
            log::debug!("In-memory rate limit store closed");
        }
        Ok(())
    }
}

pub struct InMemoryStoreBuilder {
    gc_interval: Option<Duration>,
    mode: WindowMode,
}

impl InMemoryStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired records. It
    /// does not run in [WindowMode::Shared], where the reset timer clears the map instead.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Use a single window shared by every identifier, see [WindowMode::Shared].
    pub fn shared_window(mut self, window: Duration) -> Self {
        self.mode = WindowMode::Shared(window);
        self
    }

    pub fn build(self) -> InMemoryStore {
        let anchor = Instant::now();
        let initial_reset = match self.mode {
            WindowMode::PerKey => 0,
            WindowMode::Shared(window) => {
                assert!(!window.is_zero(), "Shared window must be non-zero");
                window.min(MAX_WINDOW).as_millis() as u64
            }
        };
        let state = Arc::new(State {
            counters: DashMap::new(),
            logs: DashMap::new(),
            mode: self.mode,
            anchor,
            shared_reset_ms: AtomicU64::new(initial_reset),
            closed: AtomicBool::new(false),
        });
        let handle = match self.mode {
            WindowMode::PerKey => self
                .gc_interval
                .map(|interval| InMemoryStore::garbage_collector(state.clone(), interval)),
            WindowMode::Shared(window) => Some(InMemoryStore::reset_timer(state.clone(), window)),
        };
        InMemoryStore {
            state,
            task: Arc::new(TaskGuard { handle }),
        }
    }
}
