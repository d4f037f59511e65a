pub mod builder;

use crate::policy::backoff::Backoff;
use crate::policy::strategy::Strategy;
use crate::policy::{Decision, Policy, Usage};
use crate::store::memory::InMemoryStore;
use crate::store::Store;
use builder::AdmissionControllerBuilder;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of the store key used by the main strategy for an identifier.
pub const LIMIT_KEY_PREFIX: &str = "limit:";

/// Prefix of the store key used by the throttling counter of an identifier.
pub const THROTTLE_KEY_PREFIX: &str = "throttle:";

fn limit_key(id: &str) -> String {
    format!("{LIMIT_KEY_PREFIX}{id}")
}

fn throttle_key(id: &str) -> String {
    format!("{THROTTLE_KEY_PREFIX}{id}")
}

/// A secondary, tighter limit evaluated ahead of the main [Strategy].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    /// Requests allowed within the throttle window.
    pub max_requests: u64,
    /// Length of the throttle window.
    pub window: Duration,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
        }
    }
}

/// A shared, mutable set of identifiers.
///
/// Cloning produces another handle to the same set, so a list can be modified while the
/// controller using it is serving requests.
#[derive(Debug, Clone, Default)]
pub struct AccessList(Arc<DashSet<String>>);

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the identifier was already present.
    pub fn insert(&self, id: impl Into<String>) -> bool {
        self.0.insert(id.into())
    }

    /// Returns false if the identifier was not present.
    pub fn remove(&self, id: &str) -> bool {
        self.0.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn clear(&self) {
        self.0.clear()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<I: Into<String>> FromIterator<I> for AccessList {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let list = Self::new();
        for id in iter {
            list.insert(id);
        }
        list
    }
}

/// Which step of the admission pipeline produced a [Verdict].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Allowlisted,
    Denylisted,
    /// Limiting is disabled (a limit of zero).
    Unlimited,
    /// The window is too short to ever admit a request.
    InstantReject,
    Throttled,
    Strategy,
    /// The store failed and the controller is configured to fail open.
    StoreFailure,
}

/// The outcome of admission control for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    /// Known whenever the store was consulted successfully.
    pub usage: Option<Usage>,
    pub reason: Reason,
}

impl Verdict {
    fn without_usage(decision: Decision, reason: Reason) -> Self {
        Self {
            decision,
            usage: None,
            reason,
        }
    }
}

/// Decides whether requests may proceed, evaluating in order:
///
/// 1. Allowlisted identifiers are admitted.
/// 2. Denylisted identifiers are denied.
/// 3. A limit of zero admits everything.
/// 4. A window at or below [INSTANT_REJECT_THRESHOLD](crate::policy::INSTANT_REJECT_THRESHOLD)
///    denies everything.
/// 5. When throttling is enabled, identifiers over the throttle limit are denied.
/// 6. The configured [Strategy] decides, over-limit requests may instead be delayed when
///    exponential backoff is enabled.
///
/// Steps 1 to 4 never touch the store.
pub struct AdmissionController<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: S,
    policy: Policy,
    strategy: Strategy,
    allowlist: AccessList,
    denylist: AccessList,
    backoff: Option<Backoff>,
    throttle: Option<Throttle>,
    fail_open: bool,
}

impl<S> Clone for AdmissionController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl AdmissionController<InMemoryStore> {
    /// Builder using an [InMemoryStore] with default settings.
    ///
    /// Must be called from within an actix (or tokio local) runtime, since the store spawns its
    /// garbage collector.
    pub fn in_memory() -> AdmissionControllerBuilder<InMemoryStore> {
        AdmissionControllerBuilder::new(InMemoryStore::builder().build())
    }
}

impl<S: Store> AdmissionController<S> {
    pub fn builder(store: S) -> AdmissionControllerBuilder<S> {
        AdmissionControllerBuilder::new(store)
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn allowlist(&self) -> &AccessList {
        &self.inner.allowlist
    }

    pub fn denylist(&self) -> &AccessList {
        &self.inner.denylist
    }

    /// Decide on a request from `id`, without waiting out any backoff delay.
    ///
    /// Store failures are either logged and admitted (fail open, the default), or returned.
    pub async fn evaluate(&self, id: &str) -> Result<Verdict, S::Error> {
        match self.run_pipeline(id).await {
            Ok(verdict) => Ok(verdict),
            Err(e) if self.inner.fail_open => {
                log::warn!("Rate limit store failed: {e}, allowing the request anyway");
                Ok(Verdict::without_usage(
                    Decision::Allowed,
                    Reason::StoreFailure,
                ))
            }
            Err(e) => {
                log::error!("Rate limit store failed: {e}");
                Err(e)
            }
        }
    }

    /// As [AdmissionController::evaluate], but suspends for the backoff delay before returning a
    /// [Decision::Delayed] verdict.
    ///
    /// Dropping the returned future cancels the wait.
    pub async fn admit(&self, id: &str) -> Result<Verdict, S::Error> {
        let verdict = self.evaluate(id).await?;
        if let Some(delay) = verdict.decision.delay() {
            log::debug!("Delaying request from {id} by {delay:?}");
            actix_web::rt::time::sleep(delay).await;
        }
        Ok(verdict)
    }

    /// Current usage of `id` under the configured strategy, without recording a request.
    pub async fn usage(&self, id: &str) -> Result<Usage, S::Error> {
        self.inner
            .strategy
            .usage(&self.inner.store, &limit_key(id), &self.inner.policy)
            .await
    }

    /// Forget all usage recorded for `id`, including its throttle counter.
    pub async fn reset(&self, id: &str) -> Result<(), S::Error> {
        self.inner.store.reset_key(&limit_key(id)).await?;
        self.inner.store.reset_key(&throttle_key(id)).await
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<(), S::Error> {
        self.inner.store.close().await
    }

    async fn run_pipeline(&self, id: &str) -> Result<Verdict, S::Error> {
        let inner = &self.inner;
        if inner.allowlist.contains(id) {
            return Ok(Verdict::without_usage(
                Decision::Allowed,
                Reason::Allowlisted,
            ));
        }
        if inner.denylist.contains(id) {
            log::debug!("Denying request from denylisted {id}");
            return Ok(Verdict::without_usage(Decision::Denied, Reason::Denylisted));
        }
        match inner.policy.precheck() {
            Some(Decision::Allowed) => {
                return Ok(Verdict::without_usage(Decision::Allowed, Reason::Unlimited))
            }
            Some(decision) => {
                return Ok(Verdict::without_usage(decision, Reason::InstantReject))
            }
            None => {}
        }

        if let Some(throttle) = inner.throttle {
            let snapshot = inner
                .store
                .increment(&throttle_key(id), 1, throttle.window)
                .await?;
            if snapshot.count > throttle.max_requests {
                log::debug!("Throttling burst from {id}");
                return Ok(Verdict {
                    decision: Decision::Denied,
                    usage: Some(Usage {
                        limit: throttle.max_requests,
                        count: snapshot.count,
                        reset: snapshot.reset,
                    }),
                    reason: Reason::Throttled,
                });
            }
        }

        let evaluation = inner
            .strategy
            .evaluate(&inner.store, &limit_key(id), &inner.policy)
            .await?;
        let mut decision = evaluation.decision;
        if decision.is_denied() {
            if let (Some(backoff), Some(usage)) = (inner.backoff, evaluation.usage) {
                let delay = backoff.delay(usage.count, usage.limit);
                if !delay.is_zero() {
                    decision = Decision::Delayed(delay);
                }
            }
        }
        if decision.is_denied() {
            log::debug!("Rate limit exceeded for {id}");
        }
        Ok(Verdict {
            decision,
            usage: evaluation.usage,
            reason: Reason::Strategy,
        })
    }
}
