pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod processor;
pub mod protocol;
pub mod rate_limit;
pub mod rpc;
pub mod sanitize;
pub mod tasks;

use std::sync::Arc;

use auth::{SessionRegistry, TokenValidator};
use broker::UpdateBroker;
use config::A2aConfig;
use processor::TaskProcessor;
use rate_limit::RateLimiter;
use tasks::{TaskLifecycle, TaskStore};

/// Shared application state passed to every RPC handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<A2aConfig>,
    pub store: Arc<TaskStore>,
    pub broker: Arc<UpdateBroker>,
    pub lifecycle: Arc<TaskLifecycle>,
    pub sessions: Arc<SessionRegistry>,
    pub tokens: Arc<TokenValidator>,
    /// General RPC admission, keyed by principal.
    pub rpc_limiter: Arc<RateLimiter>,
    /// Authentication-attempt admission, keyed by peer address.
    pub auth_limiter: Arc<RateLimiter>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the core components around a processor implementation.
    pub fn new(config: A2aConfig, processor: Arc<dyn TaskProcessor>) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(TaskStore::new());
        let broker = Arc::new(UpdateBroker::new(
            Arc::clone(&store),
            config.subscriber_queue_capacity,
        ));
        let lifecycle = Arc::new(TaskLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            processor,
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.session_timeout_secs,
            config.session_absolute_timeout_secs,
        ));

        let tokens = Arc::new(TokenValidator::new(
            &config.jwt_secret,
            &config.jwt_issuer,
            &config.jwt_audience,
        ));
        for entry in &config.api_keys {
            tokens.register_api_key(
                &entry.key,
                &entry.user_id,
                entry.permissions.clone(),
                entry.expires_at,
            );
        }

        Self {
            rpc_limiter: Arc::new(RateLimiter::new(config.rpc_rate_limit())),
            auth_limiter: Arc::new(RateLimiter::new(config.auth_rate_limit())),
            config,
            store,
            broker,
            lifecycle,
            sessions,
            tokens,
            started_at: std::time::Instant::now(),
        }
    }
}
