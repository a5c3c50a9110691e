use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::middleware::auth::AuthMode;
use crate::processor::ProcessorConfig;
use crate::validate::ValidationRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}")),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "alert-ingest")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,

    #[envconfig(default = "10485760")] // 10 MiB
    pub max_body_bytes: usize,

    #[envconfig(default = "1000")]
    pub max_alerts_per_request: usize,

    #[envconfig(default = "128")]
    pub max_label_key_length: usize,

    #[envconfig(default = "30000")]
    pub request_timeout_ms: u64,

    #[envconfig(default = "2000")]
    pub timeout_grace_ms: u64,

    #[envconfig(default = "5000")]
    pub body_chunk_timeout_ms: u64,

    #[envconfig(default = "16")]
    pub worker_count: usize,

    #[envconfig(default = "2048")]
    pub queue_depth: usize,

    #[envconfig(default = "500")]
    pub submit_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub rate_limit_enabled: bool,

    #[envconfig(default = "100")]
    pub client_rate_limit: u64,

    #[envconfig(default = "60")]
    pub client_rate_window_secs: u64,

    #[envconfig(default = "10000")]
    pub global_rate_limit: u64,

    #[envconfig(default = "60")]
    pub global_rate_window_secs: u64,

    // Comma separated x-client-id values with their own rate limit window
    pub rate_limit_client_ids: Option<String>,

    #[envconfig(default = "none")]
    pub auth_mode: AuthMode,
    pub auth_token: Option<String>,
    pub hmac_secret: Option<String>,

    // Alerts are only logged when unset
    pub pipeline_url: Option<String>,

    #[envconfig(default = "5000")]
    pub pipeline_timeout_ms: u64,
}

impl Config {
    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            workers: self.worker_count,
            queue_depth: self.queue_depth,
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
        }
    }

    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            max_label_key_len: self.max_label_key_length,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }

    pub fn body_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.body_chunk_timeout_ms)
    }

    pub fn known_client_ids(&self) -> HashSet<String> {
        self.rate_limit_client_ids
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.address, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_alerts_per_request, 1000);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.auth_mode, AuthMode::None);
        assert!(config.pipeline_url.is_none());
        assert_eq!(config.processor().workers, 16);
        assert_eq!(config.validation_rules().max_label_key_len, 128);
        assert!(config.known_client_ids().is_empty());
    }

    #[test]
    fn reads_overrides() {
        let env: HashMap<String, String> = [
            ("LOG_FORMAT", "JSON"),
            ("AUTH_MODE", "hmac"),
            ("HMAC_SECRET", "s3cret"),
            ("QUEUE_DEPTH", "64"),
            ("REQUEST_TIMEOUT_MS", "1500"),
            ("RATE_LIMIT_CLIENT_IDS", "alertmanager-eu, ,alertmanager-us"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.auth_mode, AuthMode::Hmac);
        assert_eq!(config.hmac_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.processor().queue_depth, 64);
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert_eq!(
            config.known_client_ids(),
            HashSet::from(["alertmanager-eu".to_string(), "alertmanager-us".to_string()])
        );
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
