// http/mod.rs — HTTP side channel.
//
// Axum server next to the RPC socket. Endpoints:
//   GET  /.well-known/agent.json   agent card (no auth)
//   POST /a2a/auth                 bearer/API-key → session exchange
//   GET  /health                   liveness document (no auth)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::A2aConfig;
use crate::AppContext;

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.host, ctx.config.http_port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("HTTP side channel listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/.well-known/agent.json", get(get_agent_card))
        .route("/a2a/auth", post(post_auth))
        .route("/health", get(health))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .with_state(ctx)
}

/// The discovery document served at the well-known path and over the
/// `getAgentCard` RPC.
pub fn agent_card(config: &A2aConfig) -> Value {
    json!({
        "name": "a2ad",
        "description": "A2A protocol daemon",
        "url": config.agent_url,
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "streaming": true,
            "pushNotifications": true,
        },
        "defaultInputModes": ["text"],
        "defaultOutputModes": ["text"],
        "authentication": { "schemes": ["bearer"] },
    })
}

async fn get_agent_card(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(agent_card(&ctx.config))
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": ctx.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "tasks": ctx.store.count().await,
        "sessions": ctx.sessions.count(),
    }))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"a2a\"")],
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

/// `POST /a2a/auth` — validate the presented credential and mint a session
/// the client then binds over the socket with `authenticate`.
async fn post_auth(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    // Brute-force guard: attempts are limited per peer address, not per
    // principal, since the principal is exactly what is being probed.
    if let Err(e) = ctx.auth_limiter.consume(&peer.ip().to_string(), 1) {
        warn!(peer = %peer, "auth attempt rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, e.retry_after.as_secs().to_string())],
            Json(json!({
                "error": "rate limited",
                "retryAfterSeconds": e.retry_after.as_secs().max(1),
            })),
        )
            .into_response();
    }

    let Some(credential) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return unauthorized();
    };

    let principal = match ctx.tokens.validate(credential) {
        Ok(p) => p,
        Err(e) => {
            debug!(peer = %peer, reason = %e, "credential rejected");
            return unauthorized();
        }
    };

    let session = ctx.sessions.create_session(principal);
    info!(user = %session.principal.user_id, "session minted");
    Json(json!({
        "sessionId": session.id,
        "expiresIn": ctx.config.session_timeout_secs,
        "userId": session.principal.user_id,
        "permissions": session.principal.permissions,
    }))
    .into_response()
}
