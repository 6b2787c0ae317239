use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use crate::rate_limit::RateLimitConfig;
use crate::sanitize::SanitizeLimits;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4500;
const DEFAULT_SESSION_TIMEOUT: u64 = 3600;
const DEFAULT_SESSION_ABSOLUTE_TIMEOUT: u64 = 86_400;
const DEFAULT_JWT_ISSUER: &str = "a2a";
const DEFAULT_JWT_AUDIENCE: &str = "a2a-clients";
const DEFAULT_RATE_LIMIT_POINTS: u32 = 120;
const DEFAULT_RATE_LIMIT_DURATION: u64 = 60;
const DEFAULT_RATE_LIMIT_BLOCK: u64 = 300;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_PARTS: usize = 100;
const DEFAULT_MAX_TEXT_BYTES: usize = 512 * 1024;
const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 64;
const DEFAULT_MONITORING_TIMEOUT_MS: u64 = 3_600_000;
/// Auth attempts are limited much harder than general RPC traffic.
const AUTH_ATTEMPT_POINTS: u32 = 10;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// A provisioned API key (`[[api_keys]]` in the config file). The plaintext
/// is hashed on load; only the hash is retained in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Optional config file — all fields are overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    http_port: Option<u16>,
    agent_url: Option<String>,
    log: Option<String>,
    session_timeout: Option<u64>,
    session_absolute_timeout: Option<u64>,
    jwt_secret: Option<String>,
    jwt_issuer: Option<String>,
    jwt_audience: Option<String>,
    rate_limit_points: Option<u32>,
    rate_limit_duration: Option<u64>,
    rate_limit_block: Option<u64>,
    max_message_bytes: Option<usize>,
    max_parts: Option<usize>,
    max_text_bytes: Option<usize>,
    subscriber_queue_capacity: Option<usize>,
    monitoring_timeout_ms: Option<u64>,
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── CLI / env overrides ──────────────────────────────────────────────────────

/// Values collected from clap (CLI flags and their env vars). `None` falls
/// through to the TOML layer, then to the built-in default.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub agent_url: Option<String>,
    pub log: Option<String>,
    pub session_timeout: Option<u64>,
    pub session_absolute_timeout: Option<u64>,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub rate_limit_points: Option<u32>,
    pub rate_limit_duration: Option<u64>,
    pub rate_limit_block: Option<u64>,
    pub max_message_bytes: Option<usize>,
    pub max_parts: Option<usize>,
    pub max_text_bytes: Option<usize>,
    pub subscriber_queue_capacity: Option<usize>,
    pub monitoring_timeout_ms: Option<u64>,
    pub config_file: Option<std::path::PathBuf>,
}

// ─── A2aConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct A2aConfig {
    pub host: String,
    pub port: u16,
    pub http_port: u16,
    /// Self URL published in the agent card.
    pub agent_url: String,
    /// Log level filter string, e.g. "debug", "info,a2ad=trace".
    pub log: String,
    /// Sliding session lifetime in seconds.
    pub session_timeout_secs: u64,
    /// Hard cap on total session lifetime in seconds.
    pub session_absolute_timeout_secs: u64,
    /// Empty string disables the bearer method (API keys keep working).
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub rate_limit_points: u32,
    pub rate_limit_duration_secs: u64,
    pub rate_limit_block_secs: u64,
    pub max_message_bytes: usize,
    pub max_parts: usize,
    pub max_text_bytes: usize,
    pub subscriber_queue_capacity: usize,
    pub monitoring_timeout_ms: u64,
    /// API keys provisioned from the config file.
    pub api_keys: Vec<ApiKeyEntry>,
}

impl A2aConfig {
    /// Build config from CLI/env overrides plus an optional TOML file.
    pub fn new(overrides: Overrides) -> Self {
        let toml = overrides
            .config_file
            .as_deref()
            .and_then(load_toml)
            .unwrap_or_default();

        let port = overrides.port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let http_port = overrides
            .http_port
            .or(toml.http_port)
            .unwrap_or(port.wrapping_add(1));
        let agent_url = overrides
            .agent_url
            .or(toml.agent_url)
            .unwrap_or_else(|| format!("http://{DEFAULT_HOST}:{port}"));

        Self {
            host: overrides
                .host
                .or(toml.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            http_port,
            agent_url,
            log: overrides
                .log
                .or(toml.log)
                .unwrap_or_else(|| "info".to_string()),
            session_timeout_secs: overrides
                .session_timeout
                .or(toml.session_timeout)
                .unwrap_or(DEFAULT_SESSION_TIMEOUT),
            session_absolute_timeout_secs: overrides
                .session_absolute_timeout
                .or(toml.session_absolute_timeout)
                .unwrap_or(DEFAULT_SESSION_ABSOLUTE_TIMEOUT),
            jwt_secret: overrides
                .jwt_secret
                .or(toml.jwt_secret)
                .unwrap_or_default(),
            jwt_issuer: overrides
                .jwt_issuer
                .or(toml.jwt_issuer)
                .unwrap_or_else(|| DEFAULT_JWT_ISSUER.to_string()),
            jwt_audience: overrides
                .jwt_audience
                .or(toml.jwt_audience)
                .unwrap_or_else(|| DEFAULT_JWT_AUDIENCE.to_string()),
            rate_limit_points: overrides
                .rate_limit_points
                .or(toml.rate_limit_points)
                .unwrap_or(DEFAULT_RATE_LIMIT_POINTS),
            rate_limit_duration_secs: overrides
                .rate_limit_duration
                .or(toml.rate_limit_duration)
                .unwrap_or(DEFAULT_RATE_LIMIT_DURATION),
            rate_limit_block_secs: overrides
                .rate_limit_block
                .or(toml.rate_limit_block)
                .unwrap_or(DEFAULT_RATE_LIMIT_BLOCK),
            max_message_bytes: overrides
                .max_message_bytes
                .or(toml.max_message_bytes)
                .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
            max_parts: overrides
                .max_parts
                .or(toml.max_parts)
                .unwrap_or(DEFAULT_MAX_PARTS),
            max_text_bytes: overrides
                .max_text_bytes
                .or(toml.max_text_bytes)
                .unwrap_or(DEFAULT_MAX_TEXT_BYTES),
            subscriber_queue_capacity: overrides
                .subscriber_queue_capacity
                .or(toml.subscriber_queue_capacity)
                .unwrap_or(DEFAULT_SUBSCRIBER_QUEUE_CAPACITY),
            monitoring_timeout_ms: overrides
                .monitoring_timeout_ms
                .or(toml.monitoring_timeout_ms)
                .unwrap_or(DEFAULT_MONITORING_TIMEOUT_MS),
            api_keys: toml.api_keys,
        }
    }

    pub fn sanitize_limits(&self) -> SanitizeLimits {
        SanitizeLimits {
            max_parts: self.max_parts,
            max_text_len: self.max_text_bytes,
            max_message_len: self.max_message_bytes,
        }
    }

    /// Limiter config for general RPC traffic (keyed by principal).
    pub fn rpc_rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            points: self.rate_limit_points,
            duration: Duration::from_secs(self.rate_limit_duration_secs),
            block_duration: Duration::from_secs(self.rate_limit_block_secs),
        }
    }

    /// Limiter config for authentication attempts (keyed by peer address).
    pub fn auth_rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            points: AUTH_ATTEMPT_POINTS,
            duration: Duration::from_secs(self.rate_limit_duration_secs),
            block_duration: Duration::from_secs(self.rate_limit_block_secs),
        }
    }

    pub fn monitoring_timeout(&self) -> Duration {
        Duration::from_millis(self.monitoring_timeout_ms)
    }
}

impl Default for A2aConfig {
    fn default() -> Self {
        Self::new(Overrides::default())
    }
}
