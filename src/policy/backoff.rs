use std::time::Duration;

/// Delay applied to callers that are over their limit.
///
/// The delay grows geometrically with how far over the limit the caller is:
/// `base_delay * excess ^ (multiplier - 1)`, clamped to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// The delay for a caller that has made `count` requests against a limit of `max`.
    ///
    /// Zero while the caller is within the limit.
    pub fn delay(&self, count: u64, max: u64) -> Duration {
        if count <= max {
            return Duration::ZERO;
        }
        let excess = (count - max) as f64;
        let seconds = self.base_delay.as_secs_f64() * excess.powf(self.multiplier - 1.0);
        // Also catches NaN and infinity
        if !(seconds < self.max_delay.as_secs_f64()) {
            return self.max_delay;
        }
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limit() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0, 5), Duration::ZERO);
        assert_eq!(backoff.delay(5, 5), Duration::ZERO);
    }

    #[test]
    fn test_linear_growth_with_default_multiplier() {
        let backoff = Backoff::default();
        for k in 1..=10u64 {
            assert_eq!(backoff.delay(5 + k, 5), Duration::from_secs(k));
        }
    }

    #[test]
    fn test_geometric_growth() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(3600), 3.0);
        assert_eq!(backoff.delay(6, 5), Duration::from_millis(100));
        assert_eq!(backoff.delay(7, 5), Duration::from_millis(400));
        assert_eq!(backoff.delay(8, 5), Duration::from_millis(900));
    }

    #[test]
    fn test_constant_when_multiplier_is_one() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(60), 1.0);
        assert_eq!(backoff.delay(6, 5), Duration::from_millis(250));
        assert_eq!(backoff.delay(600, 5), Duration::from_millis(250));
    }

    #[test]
    fn test_monotonic_and_bounded() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(30), 2.5);
        let mut previous = Duration::ZERO;
        for count in 0..200u64 {
            let delay = backoff.delay(count, 5);
            assert!(delay >= previous);
            assert!(delay <= backoff.max_delay);
            previous = delay;
        }
        assert_eq!(previous, backoff.max_delay);
        assert_eq!(backoff.delay(u64::MAX, 0), backoff.max_delay);
    }
}
