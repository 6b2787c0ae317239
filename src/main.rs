use std::sync::Arc;
use std::time::Duration;

use a2ad::{
    auth::session,
    config::{A2aConfig, Overrides},
    http,
    processor::EchoProcessor,
    rpc, AppContext,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often the background sweepers run.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "a2ad", about = "A2A protocol daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bind address for both listeners
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// WebSocket RPC port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// HTTP side-channel port (default: PORT + 1)
    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// Self URL published in the agent card
    #[arg(long, env = "AGENT_URL")]
    agent_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "A2AD_LOG")]
    log: Option<String>,

    /// Optional TOML config file (lowest-priority override layer)
    #[arg(long, env = "CONFIG_FILE")]
    config_file: Option<std::path::PathBuf>,

    /// Session sliding lifetime in seconds
    #[arg(long, env = "SESSION_TIMEOUT")]
    session_timeout: Option<u64>,

    /// Hard cap on session lifetime in seconds
    #[arg(long, env = "SESSION_ABSOLUTE_TIMEOUT")]
    session_absolute_timeout: Option<u64>,

    /// HS256 secret for bearer verification (empty disables bearers)
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Expected JWT issuer claim
    #[arg(long, env = "JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// Expected JWT audience claim
    #[arg(long, env = "JWT_AUDIENCE")]
    jwt_audience: Option<String>,

    /// Rate-limit points per window
    #[arg(long, env = "RATE_LIMIT_POINTS")]
    rate_limit_points: Option<u32>,

    /// Rate-limit window in seconds
    #[arg(long, env = "RATE_LIMIT_DURATION")]
    rate_limit_duration: Option<u64>,

    /// Rate-limit block penalty in seconds
    #[arg(long, env = "RATE_LIMIT_BLOCK")]
    rate_limit_block: Option<u64>,

    /// Serialized message size cap in bytes
    #[arg(long, env = "MAX_MESSAGE_BYTES")]
    max_message_bytes: Option<usize>,

    /// Parts-per-message cap
    #[arg(long, env = "MAX_PARTS")]
    max_parts: Option<usize>,

    /// Per-text-part size cap in bytes
    #[arg(long, env = "MAX_TEXT_BYTES")]
    max_text_bytes: Option<usize>,

    /// Bounded per-subscriber delivery queue length
    #[arg(long, env = "SUBSCRIBER_QUEUE_CAPACITY")]
    subscriber_queue_capacity: Option<usize>,

    /// Streaming-handle watchdog in milliseconds
    #[arg(long, env = "MONITORING_TIMEOUT_MS")]
    monitoring_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    Serve,
}

fn overrides_from(args: &Args) -> Overrides {
    Overrides {
        host: args.host.clone(),
        port: args.port,
        http_port: args.http_port,
        agent_url: args.agent_url.clone(),
        log: args.log.clone(),
        session_timeout: args.session_timeout,
        session_absolute_timeout: args.session_absolute_timeout,
        jwt_secret: args.jwt_secret.clone(),
        jwt_issuer: args.jwt_issuer.clone(),
        jwt_audience: args.jwt_audience.clone(),
        rate_limit_points: args.rate_limit_points,
        rate_limit_duration: args.rate_limit_duration,
        rate_limit_block: args.rate_limit_block,
        max_message_bytes: args.max_message_bytes,
        max_parts: args.max_parts,
        max_text_bytes: args.max_text_bytes,
        subscriber_queue_capacity: args.subscriber_queue_capacity,
        monitoring_timeout_ms: args.monitoring_timeout_ms,
        config_file: args.config_file.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = A2aConfig::new(overrides_from(&args));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log)),
        )
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: A2aConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        http_port = config.http_port,
        "a2ad starting"
    );
    if config.jwt_secret.is_empty() && config.api_keys.is_empty() {
        warn!("no JWT secret and no API keys configured — nobody can authenticate");
    }

    let ctx = Arc::new(AppContext::new(config, Arc::new(EchoProcessor)));

    // Background sweepers: expired sessions and idle rate-limit keys.
    session::start_sweeper(Arc::clone(&ctx.sessions), SWEEP_INTERVAL);
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                ctx.rpc_limiter.sweep_idle();
                ctx.auth_limiter.sweep_idle();
            }
        });
    }

    // HTTP side channel runs alongside the RPC socket; the RPC server owns
    // the shutdown signal and the process exits when it returns.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = http::run(ctx).await {
                warn!(err = %e, "HTTP side channel stopped");
            }
        });
    }

    rpc::run(ctx).await
}
