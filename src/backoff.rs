use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base * factor^(attempt-1)`, capped at `max`.
///
/// `delay` is a pure function of the attempt number; randomness is only added
/// by `jittered`, so the schedule itself can be tested without a transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction of the delay added at random, `0.0..=1.0`.
    pub jitter: f64,
    /// Multiplier for rate limited responses that carry no hint.
    pub rate_limit_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(800),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.25,
            rate_limit_factor: 4.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1 = first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retrying a rate limited request.
    /// A server provided hint wins when it is longer than our own schedule.
    pub fn rate_limited_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let own = self.delay(attempt).mul_f64(self.rate_limit_factor);
        match retry_after {
            Some(hint) => hint.max(own),
            None => own,
        }
    }

    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        delay + delay.mul_f64(rng.gen_range(0.0..jitter))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));

        let delays: Vec<_> = (1..20).map(|a| policy.delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rate_limit_honors_longer_hint() {
        let policy = BackoffPolicy::default();
        let own = policy.rate_limited_delay(1, None);
        assert_eq!(own, policy.delay(1).mul_f64(policy.rate_limit_factor));

        let hint = Duration::from_secs(120);
        assert_eq!(policy.rate_limited_delay(1, Some(hint)), hint);
        assert_eq!(
            policy.rate_limited_delay(1, Some(Duration::from_millis(1))),
            own
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_secs(2);
        for _ in 0..100 {
            let d = policy.jittered(delay, &mut rng);
            assert!(d >= delay);
            assert!(d <= delay.mul_f64(1.0 + policy.jitter));
        }

        let none = BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(none.jittered(delay, &mut rng), delay);
    }
}
