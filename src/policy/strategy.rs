use crate::policy::{Decision, Policy, Usage};
use crate::store::{Snapshot, Store};

/// The rate limiting algorithm used to decide on a request.
///
/// # Fixed Window
///
/// Every request increments the identifier's counter and is denied once the count exceeds the
/// limit. Up to twice the limit may be admitted across a window boundary. Denied requests keep
/// counting, which is what lets [Backoff](crate::policy::backoff::Backoff) grow with the excess.
///
/// # Sliding Window Log
///
/// Keeps the timestamp of every admitted request and counts only those within the trailing
/// window. Exact, but the space used per identifier grows with the limit.
///
/// # Sliding Window Counter
///
/// Evaluated exactly like the sliding window log.
///
/// # Token Bucket
///
/// Admits while the identifier's counter is below the limit; denied requests do not consume
/// anything. The bucket refills when the window rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    FixedWindow,
    SlidingWindowLog,
    SlidingWindowCounter,
    TokenBucket,
}

/// The outcome of a [Strategy] for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// None when the policy decided without consulting the store.
    pub usage: Option<Usage>,
}

impl Strategy {
    fn uses_log(self) -> bool {
        matches!(self, Self::SlidingWindowLog | Self::SlidingWindowCounter)
    }

    /// Decide on a request for `key`, recording it in the store when it counts.
    pub async fn evaluate<S: Store>(
        self,
        store: &S,
        key: &str,
        policy: &Policy,
    ) -> Result<Evaluation, S::Error> {
        if let Some(decision) = policy.precheck() {
            return Ok(Evaluation {
                decision,
                usage: None,
            });
        }
        let max = policy.max_requests;
        let (allowed, snapshot) = match self {
            Self::FixedWindow => {
                let snapshot = store.increment(key, 1, policy.window).await?;
                (snapshot.count <= max, snapshot)
            }
            Self::SlidingWindowLog | Self::SlidingWindowCounter => {
                store.append_within(key, max, policy.window).await?
            }
            Self::TokenBucket => store.increment_below(key, max, policy.window).await?,
        };
        Ok(Evaluation {
            decision: Decision::from_allowed(allowed),
            usage: Some(usage(policy, snapshot)),
        })
    }

    /// Read the current usage of `key` without recording a request.
    pub async fn usage<S: Store>(
        self,
        store: &S,
        key: &str,
        policy: &Policy,
    ) -> Result<Usage, S::Error> {
        let snapshot = if self.uses_log() {
            store.get_log(key, policy.window).await?
        } else {
            store.get(key).await?
        };
        Ok(usage(policy, snapshot))
    }
}

fn usage(policy: &Policy, snapshot: Snapshot) -> Usage {
    Usage {
        limit: policy.max_requests,
        count: snapshot.count,
        reset: snapshot.reset,
    }
}
