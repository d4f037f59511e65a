use crate::admission::{AccessList, AdmissionController, Inner, Throttle};
use crate::policy::backoff::Backoff;
use crate::policy::strategy::Strategy;
use crate::policy::Policy;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REQUESTS: u64 = 5;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("The rate limit window must be greater than zero")]
    ZeroWindow,
    #[error("The backoff multiplier must be a finite number of at least 1, got {0}")]
    InvalidMultiplier(f64),
    #[error("The backoff base delay {base:?} exceeds the maximum delay {max:?}")]
    BaseDelayExceedsMax { base: Duration, max: Duration },
    #[error("The throttle window must be greater than zero")]
    ZeroThrottleWindow,
    #[error("The throttle limit must be greater than zero")]
    ZeroThrottleLimit,
    #[error("The store's shared window {shared:?} differs from the window {window:?}")]
    SharedWindowMismatch { shared: Duration, window: Duration },
}

pub struct AdmissionControllerBuilder<S> {
    store: S,
    window: Duration,
    max_requests: u64,
    strategy: Strategy,
    allowlist: AccessList,
    denylist: AccessList,
    backoff: Option<Backoff>,
    throttle: Option<Throttle>,
    fail_open: bool,
}

impl<S: Store> AdmissionControllerBuilder<S> {
    pub(super) fn new(store: S) -> Self {
        Self {
            store,
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            strategy: Strategy::default(),
            allowlist: AccessList::new(),
            denylist: AccessList::new(),
            backoff: None,
            throttle: None,
            fail_open: true,
        }
    }

    /// Length of the rate limiting window.
    ///
    /// Default is 60 seconds. Must match the window of a store with a
    /// [shared window](crate::store::Store::shared_window).
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Requests allowed per identifier within the window, zero disables limiting.
    ///
    /// Default is 5.
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Default is [Strategy::FixedWindow].
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use an existing list of identifiers that are always admitted.
    pub fn allowlist(mut self, allowlist: AccessList) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Use an existing list of identifiers that are always denied (unless also allowlisted).
    pub fn denylist(mut self, denylist: AccessList) -> Self {
        self.denylist = denylist;
        self
    }

    pub fn allow(self, id: impl Into<String>) -> Self {
        self.allowlist.insert(id);
        self
    }

    pub fn deny(self, id: impl Into<String>) -> Self {
        self.denylist.insert(id);
        self
    }

    /// Delay, rather than deny, requests that exceed the limit.
    ///
    /// Only strategies whose count keeps growing past the limit (i.e. [Strategy::FixedWindow])
    /// produce a delay; the others continue to deny.
    pub fn exponential_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Deny bursts that exceed the throttle before the main strategy is consulted.
    ///
    /// The throttle counter is kept in the same store, under [THROTTLE_KEY_PREFIX](super::THROTTLE_KEY_PREFIX),
    /// and always expires one throttle window after it was created.
    pub fn throttling(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Choose whether to allow a request if the store returns a failure.
    ///
    /// Default is true.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn build(self) -> Result<AdmissionController<S>, ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        if let Some(shared) = self.store.shared_window() {
            if shared != self.window {
                return Err(ConfigError::SharedWindowMismatch {
                    shared,
                    window: self.window,
                });
            }
        }
        if let Some(backoff) = &self.backoff {
            if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
                return Err(ConfigError::InvalidMultiplier(backoff.multiplier));
            }
            if backoff.base_delay > backoff.max_delay {
                return Err(ConfigError::BaseDelayExceedsMax {
                    base: backoff.base_delay,
                    max: backoff.max_delay,
                });
            }
        }
        if let Some(throttle) = &self.throttle {
            if throttle.window.is_zero() {
                return Err(ConfigError::ZeroThrottleWindow);
            }
            if throttle.max_requests == 0 {
                return Err(ConfigError::ZeroThrottleLimit);
            }
        }
        Ok(AdmissionController {
            inner: Arc::new(Inner {
                store: self.store,
                policy: Policy::new(self.window, self.max_requests),
                strategy: self.strategy,
                allowlist: self.allowlist,
                denylist: self.denylist,
                backoff: self.backoff,
                throttle: self.throttle,
                fail_open: self.fail_open,
            }),
        })
    }
}
