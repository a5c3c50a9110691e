use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

use crate::{EvalResult, RateLimitResponse};

const GLOBAL_RATE_LIMITER_EVAL_COUNTER: &str = "global_rate_limiter_eval_counts_total";

pub const GLOBAL_KEY: &str = "global";

struct Window {
    started: Instant,
    count: u64,
}

/// Process-wide fixed window counter.
///
/// The state lives in this process only, so there is nothing to fail open on: if
/// the lock is poisoned the limiter can no longer count and every request is
/// denied.
pub struct GlobalRateLimiter {
    threshold: u64,
    window_interval: Duration,
    window: Mutex<Window>,
}

impl GlobalRateLimiter {
    pub fn new(threshold: u64, window_interval: Duration) -> Self {
        Self {
            threshold,
            window_interval,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn check_limit(&self) -> EvalResult {
        let now = Instant::now();
        let result = match self.window.lock() {
            Ok(mut window) => {
                let elapsed = now.duration_since(window.started);
                if elapsed >= self.window_interval {
                    window.started = now;
                    window.count = 0;
                }

                if window.count < self.threshold {
                    window.count += 1;
                    EvalResult::Allowed {
                        remaining: self.threshold - window.count,
                    }
                } else {
                    let elapsed = now.duration_since(window.started);
                    EvalResult::Limited(RateLimitResponse {
                        key: GLOBAL_KEY.to_string(),
                        current_count: window.count,
                        threshold: self.threshold,
                        window_interval: self.window_interval,
                        retry_after: self.window_interval.saturating_sub(elapsed),
                    })
                }
            }
            Err(_) => {
                error!("global rate limiter lock poisoned, denying request");
                EvalResult::FailClosed
            }
        };

        metrics::counter!(
            GLOBAL_RATE_LIMITER_EVAL_COUNTER,
            "result" => result.as_tag(),
        )
        .increment(1);

        result
    }
}
