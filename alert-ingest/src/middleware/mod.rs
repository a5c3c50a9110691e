//! Layers guarding the webhook routes. `router::router` stacks them.

pub mod auth;
pub mod http_metrics;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod size_limit;
pub mod timeout;
