use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use crate::broker::StreamingTaskHandle;
use crate::protocol::Message;
use crate::rpc::callback::{CallbackRef, ConnectionSubscriber};
use crate::rpc::ConnectionCtx;
use crate::sanitize;
use crate::AppContext;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SendConfig {
    history_length: Option<usize>,
    metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Deserialize)]
struct SendMessageParams {
    message: Message,
    config: Option<SendConfig>,
}

#[derive(Deserialize)]
struct SendMessageStreamingParams {
    message: Message,
    config: Option<SendConfig>,
    callback: CallbackRef,
}

fn cap_history(mut task: crate::protocol::Task, config: &SendConfig) -> crate::protocol::Task {
    if let Some(cap) = config.history_length {
        let len = task.history.len();
        if len > cap {
            task.history.drain(..len - cap);
        }
    }
    task
}

/// `sendMessage` — sanitize, create (or follow up on) a task, start
/// processing, return the `submitted` snapshot. The `submitted → working`
/// transition is published asynchronously after this returns.
pub async fn send_message(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: SendMessageParams = serde_json::from_value(params)?;
    let config = p.config.unwrap_or_default();
    let message = sanitize::sanitize_message(&p.message, &ctx.config.sanitize_limits())?;

    let task = ctx
        .lifecycle
        .send(message, config.metadata.clone())
        .await?;
    Ok(serde_json::to_value(cap_history(task, &config))?)
}

/// `sendMessageStreaming` — like `sendMessage`, but registers the caller's
/// callback capability before processing starts, so the subscriber observes
/// the `working` transition and everything after it. The wire result is the
/// initial task snapshot; the handle stays bound to this connection and is
/// disposed with it.
pub async fn send_message_streaming(
    params: Value,
    ctx: &AppContext,
    conn: &ConnectionCtx,
) -> Result<Value> {
    let p: SendMessageStreamingParams = serde_json::from_value(params)?;
    p.callback.validate()?;
    let config = p.config.unwrap_or_default();
    let message = sanitize::sanitize_message(&p.message, &ctx.config.sanitize_limits())?;

    // Follow-ups on an existing task attach the new callback to the same
    // stream rather than creating a task. Subscribe before routing the
    // message: a follow-up to an interrupted task restarts the processor,
    // and its `working` transition and early artifacts must land in an
    // already-registered subscription.
    if let Some(task_id) = message.task_id.clone() {
        let handle = StreamingTaskHandle::new(
            &task_id,
            Arc::clone(&ctx.broker),
            Arc::clone(&ctx.store),
            ctx.config.monitoring_timeout(),
        );
        let subscriber = Arc::new(ConnectionSubscriber::new(
            conn.outbound.clone(),
            p.callback,
        ));
        handle.subscribe(subscriber).await?;

        let task = match ctx.lifecycle.follow_up(&task_id, message).await {
            Ok(task) => task,
            Err(err) => {
                handle.dispose();
                return Err(err.into());
            }
        };
        conn.track_handle(handle);
        return Ok(serde_json::to_value(cap_history(task, &config))?);
    }

    let task = ctx
        .lifecycle
        .submit(message, config.metadata.clone())
        .await;

    let handle = StreamingTaskHandle::new(
        &task.id,
        Arc::clone(&ctx.broker),
        Arc::clone(&ctx.store),
        ctx.config.monitoring_timeout(),
    );
    let subscriber = Arc::new(ConnectionSubscriber::new(
        conn.outbound.clone(),
        p.callback,
    ));
    // Subscribe before start: the snapshot event arrives first, then the
    // auto-transition to `working`.
    handle.subscribe(subscriber).await?;
    conn.track_handle(handle);

    ctx.lifecycle.start(&task.id);
    Ok(serde_json::to_value(cap_history(task, &config))?)
}
