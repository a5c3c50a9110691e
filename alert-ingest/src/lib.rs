pub mod alert;
pub mod api;
pub mod config;
pub mod context;
pub mod convert;
pub mod detect;
pub mod endpoint;
pub mod extractors;
pub mod middleware;
pub mod parse;
pub mod processor;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
pub mod token;
pub mod validate;
