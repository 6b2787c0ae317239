//! In-memory task store.
//!
//! Owns the `TaskID → Task` map and the `ContextID → ordered TaskIDs`
//! index. Every task sits behind its own async mutex, so mutations on a
//! single task are serialized while different tasks proceed independently;
//! readers always observe a whole task, never a torn one.
//!
//! A durable implementation would keep these same contracts behind the same
//! signatures.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::A2aError;
use crate::protocol::{Artifact, Message, Task, TaskState, TaskStatus};

/// Filter and paging options for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub context_id: Option<String>,
    pub states: Option<Vec<TaskState>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub page_size: Option<usize>,
    pub page_token: Option<String>,
    pub history_length: Option<usize>,
    pub include_artifacts: bool,
}

/// One page of a filtered listing.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub tasks: Vec<Task>,
    pub next_page_token: Option<String>,
    pub total_size: usize,
}

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

struct Inner {
    tasks: HashMap<String, Arc<Mutex<Task>>>,
    /// Creation order, for stable listing.
    order: Vec<String>,
    /// Context id → task ids in creation order.
    contexts: HashMap<String, Vec<String>>,
}

pub struct TaskStore {
    inner: RwLock<Inner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tasks: HashMap::new(),
                order: Vec::new(),
                contexts: HashMap::new(),
            }),
        }
    }

    /// Create a task in `submitted` from an inbound message. Mints the task
    /// id, and the context id when the message does not carry one. The
    /// message becomes the first history entry.
    pub async fn create(
        &self,
        message: Message,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Task {
        let mut task = Task::new(message.context_id.clone());
        let mut message = message;
        message.context_id = Some(task.context_id.clone());
        message.task_id = Some(task.id.clone());
        task.history.push(message);
        if let Some(metadata) = metadata {
            task.metadata = metadata;
        }

        let mut inner = self.inner.write().await;
        inner.order.push(task.id.clone());
        inner
            .contexts
            .entry(task.context_id.clone())
            .or_default()
            .push(task.id.clone());
        inner
            .tasks
            .insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        task
    }

    async fn entry(&self, task_id: &str) -> Result<Arc<Mutex<Task>>, A2aError> {
        self.inner
            .read()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| A2aError::NotFound(format!("task {task_id}")))
    }

    /// Snapshot a task, optionally truncating history to the most recent
    /// `history_length` entries.
    pub async fn get(
        &self,
        task_id: &str,
        history_length: Option<usize>,
    ) -> Result<Task, A2aError> {
        let entry = self.entry(task_id).await?;
        let task = entry.lock().await.clone();
        Ok(cap_history(task, history_length))
    }

    /// Append a message to a task's history.
    pub async fn append_history(&self, task_id: &str, message: Message) -> Result<Task, A2aError> {
        let entry = self.entry(task_id).await?;
        let mut task = entry.lock().await;
        task.history.push(message);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Add or extend an artifact. With `append`, parts are appended to the
    /// existing artifact with the same id (or the artifact is created when
    /// absent); without it, an artifact with the same id is replaced whole.
    /// Artifacts are never removed.
    pub async fn append_artifact(
        &self,
        task_id: &str,
        artifact: Artifact,
        append: bool,
    ) -> Result<Task, A2aError> {
        let entry = self.entry(task_id).await?;
        let mut task = entry.lock().await;
        let existing = task
            .artifacts
            .iter_mut()
            .find(|a| a.artifact_id == artifact.artifact_id);
        match existing {
            Some(slot) if append => slot.parts.extend(artifact.parts),
            Some(slot) => *slot = artifact,
            None => task.artifacts.push(artifact),
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Transition a task's state, enforcing the lifecycle table. Returns
    /// the updated snapshot; an illegal transition leaves the task
    /// untouched and fails with `CONFLICT`.
    pub async fn set_status(
        &self,
        task_id: &str,
        state: TaskState,
        message: Option<Message>,
    ) -> Result<Task, A2aError> {
        let entry = self.entry(task_id).await?;
        let mut task = entry.lock().await;
        let from = task.status.state;
        if !from.can_transition(state) {
            return Err(A2aError::Conflict(format!(
                "illegal transition {from} → {state} for task {task_id}"
            )));
        }
        task.status = TaskStatus {
            state,
            message,
            timestamp: Utc::now(),
        };
        task.updated_at = task.status.timestamp;
        Ok(task.clone())
    }

    /// Cancel a non-final task. Final tasks fail with `CONFLICT` and are
    /// left unchanged.
    pub async fn cancel(&self, task_id: &str, message: Option<Message>) -> Result<Task, A2aError> {
        let entry = self.entry(task_id).await?;
        let mut task = entry.lock().await;
        if task.is_final() {
            return Err(A2aError::Conflict(format!(
                "task {task_id} is already {}",
                task.status.state
            )));
        }
        task.status = TaskStatus {
            state: TaskState::Canceled,
            message,
            timestamp: Utc::now(),
        };
        task.updated_at = task.status.timestamp;
        Ok(task.clone())
    }

    /// Filtered, paginated listing. Takes a snapshot under the read lock;
    /// the page token is opaque to callers.
    pub async fn list(&self, filter: &ListFilter) -> Result<ListPage, A2aError> {
        let entries: Vec<Arc<Mutex<Task>>> = {
            let inner = self.inner.read().await;
            let ids: Vec<&String> = match &filter.context_id {
                Some(ctx) => inner
                    .contexts
                    .get(ctx)
                    .map(|ids| ids.iter().collect())
                    .unwrap_or_default(),
                None => inner.order.iter().collect(),
            };
            ids.iter()
                .filter_map(|id| inner.tasks.get(*id).cloned())
                .collect()
        };

        let mut matched = Vec::new();
        for entry in entries {
            let task = entry.lock().await;
            if let Some(states) = &filter.states {
                if !states.contains(&task.status.state) {
                    continue;
                }
            }
            if let Some(after) = filter.updated_after {
                if task.updated_at <= after {
                    continue;
                }
            }
            matched.push(task.clone());
        }

        let total_size = matched.len();
        let offset = match &filter.page_token {
            Some(token) => decode_page_token(token)?,
            None => 0,
        };
        let page_size = filter
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let page: Vec<Task> = matched
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|t| {
                let mut t = cap_history(t, filter.history_length);
                if !filter.include_artifacts {
                    t.artifacts.clear();
                }
                t
            })
            .collect();

        let next_offset = offset + page.len();
        let next_page_token = (next_offset < total_size).then(|| encode_page_token(next_offset));

        Ok(ListPage {
            tasks: page,
            next_page_token,
            total_size,
        })
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.tasks.len()
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cap_history(mut task: Task, history_length: Option<usize>) -> Task {
    if let Some(cap) = history_length {
        let len = task.history.len();
        if len > cap {
            task.history.drain(..len - cap);
        }
    }
    task
}

fn encode_page_token(offset: usize) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("o:{offset}"))
}

fn decode_page_token(token: &str) -> Result<usize, A2aError> {
    let invalid = || A2aError::InvalidParams("invalid pageToken".to_string());
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| invalid())?;
    let text = String::from_utf8(raw).map_err(|_| invalid())?;
    text.strip_prefix("o:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(invalid)
}
