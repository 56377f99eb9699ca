//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What to do with a message whose body came out empty after every
/// extraction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyBodyPolicy {
    /// Record threading metadata, skip the responder, complete the item.
    #[default]
    Accept,
    /// Treat as a retryable failure.
    Retry,
}

impl FromStr for EmptyBodyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "retry" => Ok(Self::Retry),
            other => Err(ConfigError::InvalidValue {
                key: "INBOUND_EMPTY_BODY_POLICY".into(),
                message: format!("expected `accept` or `retry`, got `{other}`"),
            }),
        }
    }
}

/// Ingestion pipeline configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port the webhook server listens on.
    pub http_port: u16,
    /// Poll interval; also the spacing between retries.
    pub poll_interval: Duration,
    /// Attempts before an item becomes terminally failed.
    pub max_attempts: u32,
    /// Items stuck in `processing` longer than this are requeued.
    pub stale_processing_after: Duration,
    /// Upper bound on a single responder call.
    pub responder_timeout: Duration,
    pub empty_body_policy: EmptyBodyPolicy,
    /// Dedup gate size (entries).
    pub dedup_capacity: usize,
    /// Dedup gate entry lifetime.
    pub dedup_ttl: Duration,
    /// Directory for rolling log files (console only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/inbound-mail.db"),
            http_port: 8080,
            poll_interval: Duration::from_secs(10),
            max_attempts: 5,
            stale_processing_after: Duration::from_secs(300), // 5 minutes
            responder_timeout: Duration::from_secs(30),
            empty_body_policy: EmptyBodyPolicy::Accept,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(86_400), // 1 day
            log_dir: None,
        }
    }
}

impl IngestConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let empty_body_policy = match std::env::var("INBOUND_EMPTY_BODY_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("{e}; using default");
                defaults.empty_body_policy
            }),
            Err(_) => defaults.empty_body_policy,
        };

        Self {
            db_path: std::env::var("INBOUND_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env_parse("INBOUND_HTTP_PORT").unwrap_or(defaults.http_port),
            poll_interval: env_secs("INBOUND_POLL_INTERVAL_SECS").unwrap_or(defaults.poll_interval),
            max_attempts: env_parse::<u32>("INBOUND_MAX_ATTEMPTS")
                .map(|n| n.max(1))
                .unwrap_or(defaults.max_attempts),
            stale_processing_after: env_secs("INBOUND_STALE_PROCESSING_SECS")
                .unwrap_or(defaults.stale_processing_after),
            responder_timeout: env_secs("INBOUND_RESPONDER_TIMEOUT_SECS")
                .unwrap_or(defaults.responder_timeout),
            empty_body_policy,
            dedup_capacity: env_parse("INBOUND_DEDUP_CAPACITY").unwrap_or(defaults.dedup_capacity),
            dedup_ttl: env_secs("INBOUND_DEDUP_TTL_SECS").unwrap_or(defaults.dedup_ttl),
            log_dir: std::env::var("INBOUND_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
