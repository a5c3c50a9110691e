use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Correlation id of one inbound request, echoed back as `x-request-id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request state handed from the timeout middleware to the handler, and from
/// there to every alert job the request submits.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    /// Point after which the handler stops waiting for outstanding alerts
    pub deadline: Instant,
    /// Cancelled once the deadline passed with work still pending
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: RequestId, timeout: Duration) -> Self {
        Self {
            request_id,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }
}
