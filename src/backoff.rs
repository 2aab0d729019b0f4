//! Retry delays shared by the stage executor and the recovery controller.

use crate::config::StagePolicy;
use rand::Rng;
use std::time::Duration;

/// Deterministic lower bound for the delay after the `attempt`-th failure
/// (1-based): `base * 2^(attempt - 1)`, capped at the policy maximum.
pub fn backoff_floor(policy: &StagePolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = policy.base_delay_ms.max(1);
    let millis = base.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(policy.max_delay_ms))
}

/// Exponential backoff with jitter.
///
/// Jitter adds up to half of the floor, so the delay for attempt `n + 1`
/// (at least twice the floor of `n`) never drops below the delay for `n`.
pub fn backoff_with<R: Rng>(policy: &StagePolicy, attempt: u32, rng: &mut R) -> Duration {
    let floor = backoff_floor(policy, attempt).as_millis() as u64;
    let jitter = if floor >= 2 {
        rng.random_range(0..=floor / 2)
    } else {
        0
    };
    Duration::from_millis(floor.saturating_add(jitter).min(policy.max_delay_ms))
}

pub fn backoff(policy: &StagePolicy, attempt: u32) -> Duration {
    backoff_with(policy, attempt, &mut rand::rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn policy() -> StagePolicy {
        StagePolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            ..StagePolicy::default()
        }
    }

    #[test]
    fn floor_doubles_until_cap() {
        let policy = policy();
        assert_eq!(backoff_floor(&policy, 1), Duration::from_secs(1));
        assert_eq!(backoff_floor(&policy, 2), Duration::from_secs(2));
        assert_eq!(backoff_floor(&policy, 4), Duration::from_secs(8));
        assert_eq!(backoff_floor(&policy, 7), Duration::from_secs(60));
        assert_eq!(backoff_floor(&policy, 200), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_is_non_decreasing_and_capped() {
        let policy = policy();
        for seed in 0..50 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut previous = Duration::ZERO;
            for attempt in 1..=12 {
                let delay = backoff_with(&policy, attempt, &mut rng);
                assert!(delay >= previous, "seed {seed} attempt {attempt}");
                assert!(delay <= policy.max_delay());
                assert!(delay >= backoff_floor(&policy, attempt));
                previous = delay;
            }
            assert_eq!(previous, policy.max_delay());
        }
    }

    #[test]
    fn zero_attempt_uses_base_delay() {
        let policy = policy();
        assert_eq!(backoff_floor(&policy, 0), Duration::from_secs(1));
    }
}
