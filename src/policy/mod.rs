pub mod backoff;
pub mod strategy;

use actix_web::rt::time::Instant;
use std::time::Duration;

/// Windows at or below this length deny every request without consulting the store.
pub const INSTANT_REJECT_THRESHOLD: Duration = Duration::from_millis(50);

/// The limit applied to every identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// The rate limiting window.
    pub window: Duration,
    /// The total requests to be allowed within the window, zero disables limiting.
    pub max_requests: u64,
}

impl Policy {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// The decision for policies that never need to look at usage.
    pub fn precheck(&self) -> Option<Decision> {
        if self.max_requests == 0 {
            Some(Decision::Allowed)
        } else if self.window <= INSTANT_REJECT_THRESHOLD {
            Some(Decision::Denied)
        } else {
            None
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    /// Allowed once the caller has been held back for the given duration.
    Delayed(Duration),
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    /// True for both immediate and delayed admission.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed | Self::Delayed(_))
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }

    pub fn delay(self) -> Option<Duration> {
        match self {
            Self::Delayed(delay) => Some(delay),
            _ => None,
        }
    }
}

/// Usage of an identifier after a request has been evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Requests counted against the identifier so far.
    pub count: u64,
    /// Time at which the usage resets.
    pub reset: Instant,
}

impl Usage {
    /// Number of requests that will be permitted until the limit resets.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// Seconds until the rate limit resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    pub fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}
