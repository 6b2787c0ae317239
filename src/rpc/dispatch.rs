//! Frame decoding and method dispatch.
//!
//! Frames are single JSON documents:
//! - request  `{"id": <correlator>, "method": <string>, "params": <object>}`
//! - response `{"id": <correlator>, "result": <value>}`
//! - error    `{"id": <correlator>, "error": {"code": <string>, "message": <string>}}`
//!
//! Server pushes are request frames whose `method` is a subscriber-defined
//! update receiver; inbound frames without a `method` are client responses
//! to those pushes and are dropped.
//!
//! Method tiers: `getAgentCard` and `authenticate` are public; everything
//! else requires a session bound to this connection. Every authenticated
//! call slides the session expiry and consumes one rate-limit point for the
//! principal.

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, trace};

use crate::error::{self, A2aError};
use crate::rpc::handlers;
use crate::rpc::ConnectionCtx;
use crate::AppContext;

#[derive(Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Decode and dispatch one inbound text frame. Returns the serialized
/// response frame, or `None` when the frame needs no reply (a client
/// response to a server push).
pub async fn dispatch_text(text: &str, ctx: &AppContext, conn: &ConnectionCtx) -> Option<String> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            return Some(error_response(
                Value::Null,
                error::INVALID_PARAMS,
                "unparseable frame",
                None,
            ));
        }
    };

    let Some(method) = frame.method else {
        // Response to one of our push frames; nothing to do.
        trace!("response frame ignored");
        return None;
    };

    let id = frame.id.unwrap_or(Value::Null);
    let params = frame.params.unwrap_or(Value::Null);
    trace!(method = %method, "rpc dispatch");

    let result = dispatch(&method, params, ctx, conn).await;
    Some(match result {
        Ok(value) => {
            let resp = serde_json::json!({ "id": id, "result": value });
            resp.to_string()
        }
        Err(e) => {
            let (code, message, retry_after) = classify_error(&e);
            error_response(id, code, &message, retry_after)
        }
    })
}

async fn dispatch(
    method: &str,
    params: Value,
    ctx: &AppContext,
    conn: &ConnectionCtx,
) -> anyhow::Result<Value> {
    // ── Public tier ──────────────────────────────────────────────────────────
    match method {
        "getAgentCard" => return Ok(crate::http::agent_card(&ctx.config)),
        "authenticate" => return handlers::auth::authenticate(params, ctx, conn).await,
        _ => {}
    }

    // ── Authenticated tier ───────────────────────────────────────────────────
    let principal = require_session(ctx, conn)?;
    ctx.rpc_limiter
        .consume(&principal.user_id, 1)
        .map_err(|e| A2aError::RateLimited {
            retry_after_seconds: e.retry_after.as_secs().max(1),
        })?;

    match method {
        "sendMessage" => handlers::message::send_message(params, ctx).await,
        "sendMessageStreaming" => {
            handlers::message::send_message_streaming(params, ctx, conn).await
        }
        "getTask" => handlers::tasks::get_task(params, ctx).await,
        "listTasks" => handlers::tasks::list_tasks(params, ctx).await,
        "cancelTask" => handlers::tasks::cancel_task(params, ctx).await,
        "subscribeToPushNotifications" => {
            handlers::tasks::subscribe_push(params, ctx, conn).await
        }
        _ => Err(A2aError::MethodNotFound(method.to_string()).into()),
    }
}

/// Check the connection's session binding: present, still live, and slid
/// forward. On expiry the binding is cleared so the client must
/// re-authenticate.
fn require_session(
    ctx: &AppContext,
    conn: &ConnectionCtx,
) -> Result<crate::auth::Principal, A2aError> {
    let bound = conn
        .session
        .lock()
        .expect("connection session lock")
        .clone();
    let Some(bound) = bound else {
        return Err(A2aError::Unauthorized);
    };

    if !ctx
        .sessions
        .extend(&bound.session_id, ctx.config.session_timeout_secs)
    {
        conn.session.lock().expect("connection session lock").take();
        return Err(A2aError::Unauthorized);
    }
    Ok(bound.principal)
}

/// Translate a handler error into the wire `{code, message}` pair. Typed
/// errors map directly; serde decode failures surface as `INVALID_PARAMS`;
/// everything else is an opaque `INTERNAL_ERROR`.
fn classify_error(e: &anyhow::Error) -> (&'static str, String, Option<u64>) {
    if let Some(a2a) = e.downcast_ref::<A2aError>() {
        let message = match a2a {
            // Never reveal whether the session or credential ever existed.
            A2aError::Unauthorized => "unauthorized".to_string(),
            A2aError::Internal => "internal error".to_string(),
            other => other.to_string(),
        };
        return (a2a.code(), message, a2a.retry_after_seconds());
    }

    let msg = e.to_string();
    if msg.contains("missing field") || msg.contains("invalid type") || msg.contains("unknown variant")
    {
        return (error::INVALID_PARAMS, format!("invalid params: {msg}"), None);
    }

    error!(err = %e, "internal error");
    (error::INTERNAL_ERROR, "internal error".to_string(), None)
}

pub fn error_response(
    id: Value,
    code: &str,
    message: &str,
    retry_after_seconds: Option<u64>,
) -> String {
    let mut error = serde_json::json!({ "code": code, "message": message });
    if let Some(secs) = retry_after_seconds {
        error["retryAfterSeconds"] = serde_json::json!(secs);
    }
    serde_json::json!({ "id": id, "error": error }).to_string()
}
