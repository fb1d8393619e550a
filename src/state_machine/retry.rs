use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{FlowgateError, Result};

pub const MAX_RETRY_ATTEMPTS: u32 = 1000;
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Per-module retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry `attempts` times, waiting `seconds` between attempts.
    Constant { attempts: u32, seconds: u64 },
    /// Retry `attempts` times, waiting `seconds * multiplier^fail_count`,
    /// jittered by up to ± `random_factor` of that value.
    Exponential {
        attempts: u32,
        multiplier: f64,
        seconds: u64,
        #[serde(default)]
        random_factor: f64,
    },
}

/// The evaluator's answer for one failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryPolicy::Constant { attempts, .. } => *attempts,
            RetryPolicy::Exponential { attempts, .. } => *attempts,
        }
    }

    /// Delay before the retry following the `fail_count`-th failure,
    /// without jitter. `None` once attempts are used up.
    pub fn base_delay(&self, fail_count: u32) -> Option<Duration> {
        if fail_count >= self.attempts().min(MAX_RETRY_ATTEMPTS) {
            return None;
        }
        let secs = match self {
            RetryPolicy::Constant { seconds, .. } => *seconds as f64,
            RetryPolicy::Exponential {
                multiplier,
                seconds,
                ..
            } => *seconds as f64 * multiplier.powi(fail_count.min(i32::MAX as u32) as i32),
        };
        Some(clamp_secs(secs))
    }

    pub fn validate(&self, module: &str) -> Result<()> {
        let invalid = |reason: &str| FlowgateError::InvalidRetry {
            module: module.to_string(),
            reason: reason.to_string(),
        };
        if self.attempts() > MAX_RETRY_ATTEMPTS {
            return Err(invalid("attempts must not exceed 1000"));
        }
        if let RetryPolicy::Exponential {
            attempts,
            multiplier,
            seconds,
            random_factor,
        } = self
        {
            if *attempts > 0 && *seconds == 0 {
                return Err(invalid(
                    "exponential base (seconds) must be greater than 0",
                ));
            }
            if !multiplier.is_finite() || *multiplier <= 0.0 {
                return Err(invalid("multiplier must be a positive number"));
            }
            if !(0.0..=1.0).contains(random_factor) {
                return Err(invalid("random_factor must be between 0 and 1"));
            }
        }
        Ok(())
    }
}

/// Decide whether the module gets another attempt after `fail_count`
/// previous failures. A missing policy fails fast.
pub fn evaluate(policy: Option<&RetryPolicy>, fail_count: u32) -> RetryDecision {
    evaluate_with(policy, fail_count, &mut rand::thread_rng())
}

pub fn evaluate_with<R: Rng>(
    policy: Option<&RetryPolicy>,
    fail_count: u32,
    rng: &mut R,
) -> RetryDecision {
    let Some(policy) = policy else {
        return RetryDecision::Exhausted;
    };
    let Some(base) = policy.base_delay(fail_count) else {
        return RetryDecision::Exhausted;
    };

    let delay = match policy {
        RetryPolicy::Exponential { random_factor, .. } if *random_factor > 0.0 => {
            let factor = rng.gen_range(-*random_factor..=*random_factor);
            clamp_secs(base.as_secs_f64() * (1.0 + factor))
        }
        _ => base,
    };
    tracing::warn!(
        fail_count,
        delay_secs = delay.as_secs_f64(),
        "Rescheduling module after failure"
    );
    RetryDecision::RetryAfter(delay)
}

fn clamp_secs(secs: f64) -> Duration {
    if !secs.is_finite() || secs >= MAX_RETRY_INTERVAL.as_secs_f64() {
        MAX_RETRY_INTERVAL
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn exponential(attempts: u32, random_factor: f64) -> RetryPolicy {
        RetryPolicy::Exponential {
            attempts,
            multiplier: 2.0,
            seconds: 3,
            random_factor,
        }
    }

    #[test]
    fn no_policy_fails_fast() {
        assert_eq!(evaluate(None, 0), RetryDecision::Exhausted);
    }

    #[test]
    fn constant_retries_until_attempts() {
        let policy = RetryPolicy::Constant {
            attempts: 2,
            seconds: 5,
        };
        assert_eq!(
            evaluate(Some(&policy), 0),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            evaluate(Some(&policy), 1),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(evaluate(Some(&policy), 2), RetryDecision::Exhausted);
    }

    #[test]
    fn exponential_backoff_is_strictly_increasing() {
        let policy = exponential(5, 0.0);
        let delays: Vec<Duration> = (0..5).filter_map(|n| policy.base_delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12),
                Duration::from_secs(24),
                Duration::from_secs(48),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(evaluate(Some(&policy), 5), RetryDecision::Exhausted);
    }

    #[test]
    fn jitter_stays_within_random_factor() {
        let policy = exponential(10, 0.25);
        let mut rng = StdRng::seed_from_u64(7);
        for fail_count in 0..10 {
            let base = policy.base_delay(fail_count).unwrap().as_secs_f64();
            match evaluate_with(Some(&policy), fail_count, &mut rng) {
                RetryDecision::RetryAfter(d) => {
                    let d = d.as_secs_f64();
                    assert!(d >= base * 0.75 - 1e-9 && d <= base * 1.25 + 1e-9);
                }
                RetryDecision::Exhausted => panic!("should retry"),
            }
        }
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::Exponential {
            attempts: 100,
            multiplier: 10.0,
            seconds: 60,
            random_factor: 0.0,
        };
        assert_eq!(policy.base_delay(50), Some(MAX_RETRY_INTERVAL));
    }

    #[test]
    fn validation_rejects_zero_exponential_base() {
        let policy = RetryPolicy::Exponential {
            attempts: 3,
            multiplier: 2.0,
            seconds: 0,
            random_factor: 0.0,
        };
        assert!(policy.validate("b").is_err());
        assert!(exponential(3, 0.1).validate("b").is_ok());
        assert!(exponential(3, 1.5).validate("b").is_err());
    }

    #[test]
    fn deserializes_tagged_policies() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"constant": {"attempts": 3, "seconds": 10}}"#).unwrap();
        assert_eq!(
            policy,
            RetryPolicy::Constant {
                attempts: 3,
                seconds: 10
            }
        );
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"exponential": {"attempts": 2, "multiplier": 1.5, "seconds": 4}}"#,
        )
        .unwrap();
        assert_eq!(policy.attempts(), 2);
    }
}
