//! Capability callbacks: reverse-direction invocation targets.
//!
//! A subscriber passed over the socket is a pair of client-chosen method
//! names. The broker never sees the connection — it holds an
//! [`UpdateSubscriber`] whose invocations serialize a request frame onto the
//! connection's outbound queue. When the socket closes the send fails, and
//! that failure is the broker's sole signal to prune the subscription.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broker::UpdateSubscriber;
use crate::protocol::{TaskArtifactUpdateEvent, TaskStatusUpdateEvent};

/// The two-method capability named in `callback` params.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRef {
    pub on_status_update: String,
    pub on_artifact_update: String,
}

impl CallbackRef {
    /// Reject empty or absurdly long method names before registering.
    pub fn validate(&self) -> Result<(), crate::error::A2aError> {
        for name in [&self.on_status_update, &self.on_artifact_update] {
            if name.is_empty() || name.len() > 128 {
                return Err(crate::error::A2aError::InvalidParams(
                    "callback method names must be 1–128 characters".to_string(),
                ));
            }
        }
        Ok(())
    }
}

static PUSH_SEQ: AtomicU64 = AtomicU64::new(1);

/// Broker-facing subscriber bound to one connection's outbound queue.
pub struct ConnectionSubscriber {
    outbound: mpsc::Sender<WsMessage>,
    callback: CallbackRef,
}

impl ConnectionSubscriber {
    pub fn new(outbound: mpsc::Sender<WsMessage>, callback: CallbackRef) -> Self {
        Self { outbound, callback }
    }

    async fn push(&self, method: &str, params: serde_json::Value) -> anyhow::Result<()> {
        let frame = serde_json::json!({
            "id": format!("push-{}", PUSH_SEQ.fetch_add(1, Ordering::Relaxed)),
            "method": method,
            "params": params,
        });
        self.outbound
            .send(WsMessage::Text(frame.to_string()))
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}

#[async_trait]
impl UpdateSubscriber for ConnectionSubscriber {
    async fn on_status_update(&self, event: &TaskStatusUpdateEvent) -> anyhow::Result<()> {
        self.push(&self.callback.on_status_update, serde_json::to_value(event)?)
            .await
    }

    async fn on_artifact_update(&self, event: &TaskArtifactUpdateEvent) -> anyhow::Result<()> {
        self.push(
            &self.callback.on_artifact_update,
            serde_json::to_value(event)?,
        )
        .await
    }
}
