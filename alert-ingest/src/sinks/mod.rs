use async_trait::async_trait;
use thiserror::Error;

use crate::alert::Alert;
use crate::context::RequestContext;

pub mod http;
pub mod print;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The pipeline could not be reached or is overloaded
    #[error("pipeline unavailable: {0}")]
    Unavailable(String),
    /// The pipeline refused this particular alert
    #[error("alert rejected: {0}")]
    Rejected(String),
}

/// Downstream processing pipeline for converted alerts.
///
/// Called once per alert from a processor worker. Implementations may watch
/// `ctx.cancel` to give up once the originating request stopped waiting.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn process(&self, ctx: &RequestContext, alert: &Alert) -> Result<(), SinkError>;
}
