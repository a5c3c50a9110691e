use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::store::{RateLimitStore, WindowDecision};
use crate::{EvalResult, FailOpenReason, RateLimitResponse};

const CLIENT_RATE_LIMITER_EVAL_COUNTER: &str = "client_rate_limiter_eval_counts_total";
const RATE_LIMIT_STORE_ERROR_COUNTER: &str = "rate_limit_store_errors_total";
const RATE_LIMIT_STORE_READ_HISTOGRAM: &str = "rate_limit_store_hit_seconds";

/// Configuration for the per-client limiter
#[derive(Debug, Clone)]
pub struct ClientRateLimiterConfig {
    /// Requests allowed per client within `window_interval`
    pub threshold: u64,
    /// Length of the sliding window
    pub window_interval: Duration,
    /// Upper bound on a single store call before failing open
    pub store_timeout: Duration,
}

impl Default for ClientRateLimiterConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            window_interval: Duration::from_secs(60),
            store_timeout: Duration::from_millis(50),
        }
    }
}

/// Per-client sliding window limiter backed by a `RateLimitStore`.
///
/// A store that errors or does not answer within `store_timeout` lets the request
/// through: an outage in the limiter's backing store must not take ingestion down
/// with it.
#[derive(Clone)]
pub struct ClientRateLimiter {
    config: ClientRateLimiterConfig,
    store: Arc<dyn RateLimitStore>,
}

impl ClientRateLimiter {
    pub fn new(config: ClientRateLimiterConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self { config, store }
    }

    pub fn threshold(&self) -> u64 {
        self.config.threshold
    }

    /// Count one request for `key` and report whether it may proceed.
    pub async fn check_limit(&self, key: &str) -> EvalResult {
        let started = tokio::time::Instant::now();
        let hit = tokio::time::timeout(
            self.config.store_timeout,
            self.store
                .hit(key, self.config.threshold, self.config.window_interval),
        )
        .await;
        metrics::histogram!(RATE_LIMIT_STORE_READ_HISTOGRAM)
            .record(started.elapsed().as_secs_f64());

        let result = match hit {
            Ok(Ok(WindowDecision::Admitted { count })) => EvalResult::Allowed {
                remaining: self.config.threshold.saturating_sub(count),
            },
            Ok(Ok(WindowDecision::Rejected { count, retry_after })) => {
                EvalResult::Limited(RateLimitResponse {
                    key: key.to_string(),
                    current_count: count,
                    threshold: self.config.threshold,
                    window_interval: self.config.window_interval,
                    retry_after,
                })
            }
            Ok(Err(e)) => {
                metrics::counter!(RATE_LIMIT_STORE_ERROR_COUNTER, "cause" => "store_error")
                    .increment(1);
                warn!(key = key, error = %e, "rate limit store failed, failing open");
                EvalResult::FailOpen {
                    reason: FailOpenReason::StoreError,
                }
            }
            Err(_) => {
                metrics::counter!(RATE_LIMIT_STORE_ERROR_COUNTER, "cause" => "timeout")
                    .increment(1);
                warn!(key = key, "rate limit store timed out, failing open");
                EvalResult::FailOpen {
                    reason: FailOpenReason::StoreTimeout,
                }
            }
        };

        metrics::counter!(
            CLIENT_RATE_LIMITER_EVAL_COUNTER,
            "result" => result.as_tag(),
        )
        .increment(1);

        result
    }
}
