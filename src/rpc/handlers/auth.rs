use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::A2aError;
use crate::rpc::{BoundSession, ConnectionCtx};
use crate::AppContext;

#[derive(Deserialize)]
struct AuthenticateParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `authenticate` — bind a session minted by `POST /a2a/auth` to this
/// connection. All failure modes collapse to `UNAUTHORIZED` so a caller
/// cannot probe which sessions exist.
pub async fn authenticate(params: Value, ctx: &AppContext, conn: &ConnectionCtx) -> Result<Value> {
    let p: AuthenticateParams = serde_json::from_value(params)?;

    let session = ctx
        .sessions
        .bind_connection(&p.session_id, conn.id)
        .ok_or(A2aError::Unauthorized)?;

    debug!(connection = conn.id, user = %session.principal.user_id, "session bound");
    let principal = session.principal.clone();
    conn.session
        .lock()
        .expect("connection session lock")
        .replace(BoundSession {
            session_id: session.id.clone(),
            principal: principal.clone(),
        });

    Ok(json!({
        "authenticated": true,
        "userId": principal.user_id,
        "permissions": principal.permissions,
        "expiresAt": session.expires_at.to_rfc3339(),
    }))
}
