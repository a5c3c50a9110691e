pub mod fixed_window;
pub mod sliding_window;
pub mod store;

use std::time::Duration;

pub use fixed_window::GlobalRateLimiter;
pub use sliding_window::{ClientRateLimiter, ClientRateLimiterConfig};
pub use store::{InMemoryStore, RateLimitStore, StoreError, WindowDecision};

/// Response returned when a key is rate limited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResponse {
    /// The key that was rate limited ("global" for the process-wide gate)
    pub key: String,
    /// Requests counted in the current window
    pub current_count: u64,
    /// The limit threshold that was exceeded
    pub threshold: u64,
    /// Length of the evaluated window
    pub window_interval: Duration,
    /// How long the client should wait before a retry can succeed
    pub retry_after: Duration,
}

/// Reason for failing open (not enforcing rate limit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOpenReason {
    /// Store operation timed out
    StoreTimeout,
    /// Store returned an error
    StoreError,
}

impl FailOpenReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreTimeout => "store_timeout",
            Self::StoreError => "store_error",
        }
    }
}

/// Result of evaluating a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalResult {
    /// Request allowed, with the number of requests left in the window
    Allowed { remaining: u64 },
    /// Request rate limited, includes response metadata
    Limited(RateLimitResponse),
    /// Backing store unavailable, request allowed without counting
    FailOpen { reason: FailOpenReason },
    /// Limiter state unusable, request denied
    FailClosed,
}

impl EvalResult {
    /// True when the request must be turned away.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Limited(_) | Self::FailClosed)
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Allowed { .. } => "allowed",
            Self::Limited(_) => "limited",
            Self::FailOpen { .. } => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }
}
