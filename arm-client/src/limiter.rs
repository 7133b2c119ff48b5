// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Token-bucket admission control for the resource client.

use cirrus_common::config::RateLimitConfig;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How a limiter treats admission requests.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateLimitPolicy {
    /// Admit every request.  Used when rate limiting is disabled.
    Always,
    /// Reject every request.  Useful in tests and for fencing off a call
    /// kind entirely.
    Never,
    /// Classic token bucket: `burst` capacity refilled at `qps` per second.
    TokenBucket { qps: f64, burst: u32 },
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            RateLimitPolicy::Always
        } else {
            RateLimitPolicy::TokenBucket {
                qps: config.qps,
                burst: config.burst,
            }
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// One admission gate.  The client holds one per call kind.
///
/// Admission is non-blocking: a request either claims a token now or is
/// rejected with an estimate of when the next token becomes available.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    state: Mutex<BucketState>,
}

/// Rejections from a `Never` limiter carry this wait estimate; retrying will
/// not help, but callers uniformly convert the estimate into a throttle
/// resume time, which must stay finite.
const NEVER_RETRY_ESTIMATE: Duration = Duration::from_secs(60);

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> RateLimiter {
        let burst = match policy {
            RateLimitPolicy::TokenBucket { burst, .. } => f64::from(burst),
            _ => 0.0,
        };
        RateLimiter {
            policy,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to claim one token.  On rejection, returns the estimated
    /// wait until a token would be available.
    pub fn try_claim(&self) -> Result<(), Duration> {
        match self.policy {
            RateLimitPolicy::Always => Ok(()),
            RateLimitPolicy::Never => Err(NEVER_RETRY_ESTIMATE),
            RateLimitPolicy::TokenBucket { qps, burst } => {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill);
                state.tokens = (state.tokens + elapsed.as_secs_f64() * qps)
                    .min(f64::from(burst));
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    Ok(())
                } else {
                    // estimate only; clamp so a tiny qps cannot overflow
                    let deficit = 1.0 - state.tokens;
                    let wait_secs =
                        (deficit / qps.max(f64::MIN_POSITIVE)).min(3600.0);
                    Err(Duration::from_secs_f64(wait_secs))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_always_and_never() {
        let always = RateLimiter::new(RateLimitPolicy::Always);
        for _ in 0..1000 {
            assert!(always.try_claim().is_ok());
        }

        let never = RateLimiter::new(RateLimitPolicy::Never);
        assert!(never.try_claim().is_err());
    }

    #[tokio::test]
    async fn test_bucket_exhaustion() {
        let limiter = RateLimiter::new(RateLimitPolicy::TokenBucket {
            qps: 0.001,
            burst: 3,
        });
        assert!(limiter.try_claim().is_ok());
        assert!(limiter.try_claim().is_ok());
        assert!(limiter.try_claim().is_ok());
        let wait = limiter.try_claim().unwrap_err();
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills() {
        let limiter = RateLimiter::new(RateLimitPolicy::TokenBucket {
            qps: 10.0,
            burst: 1,
        });
        assert!(limiter.try_claim().is_ok());
        assert!(limiter.try_claim().is_err());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.try_claim().is_ok());
    }
}
