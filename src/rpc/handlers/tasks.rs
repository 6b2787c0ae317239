use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::protocol::TaskState;
use crate::rpc::callback::{CallbackRef, ConnectionSubscriber};
use crate::rpc::ConnectionCtx;
use crate::tasks::ListFilter;
use crate::AppContext;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTaskParams {
    task_id: String,
    history_length: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListTasksParams {
    context_id: Option<String>,
    states: Option<Vec<TaskState>>,
    page_size: Option<usize>,
    page_token: Option<String>,
    history_length: Option<usize>,
    last_updated_after: Option<DateTime<Utc>>,
    #[serde(default)]
    include_artifacts: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdParams {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeParams {
    task_id: String,
    callback: CallbackRef,
}

pub async fn get_task(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: GetTaskParams = serde_json::from_value(params)?;
    let task = ctx.store.get(&p.task_id, p.history_length).await?;
    Ok(serde_json::to_value(task)?)
}

pub async fn list_tasks(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: ListTasksParams = if params.is_null() {
        ListTasksParams::default()
    } else {
        serde_json::from_value(params)?
    };
    let page = ctx
        .store
        .list(&ListFilter {
            context_id: p.context_id,
            states: p.states,
            updated_after: p.last_updated_after,
            page_size: p.page_size,
            page_token: p.page_token,
            history_length: p.history_length,
            include_artifacts: p.include_artifacts,
        })
        .await?;
    Ok(json!({
        "tasks": page.tasks,
        "nextPageToken": page.next_page_token,
        "totalSize": page.total_size,
    }))
}

/// `cancelTask` — cancel a non-final task; the subscriber stream receives
/// the terminal `canceled` event. Canceling a final task is `CONFLICT`.
pub async fn cancel_task(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: TaskIdParams = serde_json::from_value(params)?;
    let task = ctx.lifecycle.cancel(&p.task_id).await?;
    Ok(serde_json::to_value(task)?)
}

/// `subscribeToPushNotifications` — attach a callback capability to an
/// existing task. Late joiners immediately receive a snapshot event.
pub async fn subscribe_push(params: Value, ctx: &AppContext, conn: &ConnectionCtx) -> Result<Value> {
    let p: SubscribeParams = serde_json::from_value(params)?;
    p.callback.validate()?;

    let subscriber = Arc::new(ConnectionSubscriber::new(
        conn.outbound.clone(),
        p.callback,
    ));
    let handle = ctx.broker.subscribe(&p.task_id, subscriber).await?;
    conn.track_subscription(handle);
    Ok(json!({ "ok": true }))
}
