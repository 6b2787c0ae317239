//! Wire data model for the A2A protocol surface.
//!
//! A Task is the stateful unit of work. Tasks have a full lifecycle with
//! well-defined state transitions:
//!
//! ```text
//! submitted → working → completed (final)
//!                     → failed (final)
//!                     → canceled (final)
//!                     → input-required → working
//!                     → auth-required  → working
//! submitted → rejected (final)
//! ```
//!
//! All types serialize camelCase to match the protocol JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// File payload of a file part: named bytes or a fetchable URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Base64-encoded inline content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// One segment of a message or artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    },
    File {
        file: FileContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    },
    Data {
        data: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    },
}

impl Part {
    /// Convenience constructor for a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            metadata: None,
        }
    }
}

/// A single turn in a task's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl Message {
    /// Build an agent-authored message bound to a task.
    pub fn agent(task_id: &str, context_id: &str, parts: Vec<Part>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            context_id: Some(context_id.to_string()),
            task_id: Some(task_id.to_string()),
            role: Role::Agent,
            parts,
            metadata: None,
        }
    }
}

// ─── Artifacts ────────────────────────────────────────────────────────────────

/// A named output produced by a task, possibly delivered in appended chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

// ─── Task state machine ───────────────────────────────────────────────────────

/// The closed set of task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    AuthRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
}

impl TaskState {
    /// Final states admit no outgoing transition.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Canceled | TaskState::Failed | TaskState::Rejected
        )
    }

    /// Interrupted states wait for the client and may resume to `working`.
    pub fn is_interrupted(self) -> bool {
        matches!(self, TaskState::InputRequired | TaskState::AuthRequired)
    }

    /// Whether the `self → to` transition is allowed.
    ///
    /// `submitted → canceled` is included: an external cancel can arrive
    /// before the automatic transition to `working` has been published.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        match self {
            Submitted => matches!(to, Working | Rejected | Canceled),
            Working => matches!(
                to,
                InputRequired | AuthRequired | Completed | Canceled | Failed
            ),
            InputRequired | AuthRequired => matches!(to, Working | Canceled | Failed),
            Completed | Canceled | Failed | Rejected => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::AuthRequired => "auth-required",
            TaskState::Completed => "completed",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Current status of a task: the state, an optional agent message
/// explaining it, and when it was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Utc::now(),
        }
    }
}

// ─── Task ─────────────────────────────────────────────────────────────────────

/// The central entity: an asynchronous unit of work with a state machine,
/// an append-only message history, and accumulated artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Groups related tasks into a conversation. Server-minted on the first
    /// task of a context, stable for the task's lifetime.
    pub context_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a task in `submitted` with a minted id (and context id when
    /// the message does not name one).
    pub fn new(context_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            status: TaskStatus::new(TaskState::Submitted),
            history: Vec::new(),
            artifacts: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.state.is_final()
    }
}

// ─── Update events ────────────────────────────────────────────────────────────

/// Pushed to subscribers whenever a task's status changes.
///
/// Exactly one status event per task carries `final = true`, and it is the
/// last event any subscriber of that task receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    pub task_id: String,
    pub context_id: String,
    pub status: TaskStatus,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// Pushed to subscribers when a task produces or extends an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    pub task_id: String,
    pub context_id: String,
    pub artifact: Artifact,
    /// `true` when `artifact.parts` extend a previously sent artifact with
    /// the same `artifact_id` rather than replacing it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<bool>,
}

/// Either kind of update, as broadcast by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UpdateEvent {
    StatusUpdate(TaskStatusUpdateEvent),
    ArtifactUpdate(TaskArtifactUpdateEvent),
}

impl UpdateEvent {
    pub fn task_id(&self) -> &str {
        match self {
            UpdateEvent::StatusUpdate(e) => &e.task_id,
            UpdateEvent::ArtifactUpdate(e) => &e.task_id,
        }
    }

    pub fn context_id(&self) -> &str {
        match self {
            UpdateEvent::StatusUpdate(e) => &e.context_id,
            UpdateEvent::ArtifactUpdate(e) => &e.context_id,
        }
    }

    /// Only a status event can close the stream.
    pub fn is_final(&self) -> bool {
        matches!(self, UpdateEvent::StatusUpdate(e) if e.is_final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_states_admit_no_transition() {
        use TaskState::*;
        for from in [Completed, Canceled, Failed, Rejected] {
            for to in [
                Submitted,
                Working,
                InputRequired,
                AuthRequired,
                Completed,
                Canceled,
                Failed,
                Rejected,
            ] {
                assert!(!from.can_transition(to), "{from} → {to} must be rejected");
            }
        }
    }

    #[test]
    fn interrupted_states_resume_to_working() {
        assert!(TaskState::InputRequired.can_transition(TaskState::Working));
        assert!(TaskState::AuthRequired.can_transition(TaskState::Working));
        assert!(!TaskState::InputRequired.can_transition(TaskState::Completed));
    }

    #[test]
    fn state_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
        let back: TaskState = serde_json::from_str("\"auth-required\"").unwrap();
        assert_eq!(back, TaskState::AuthRequired);
    }

    #[test]
    fn status_event_roundtrip_keeps_final_flag() {
        let event = TaskStatusUpdateEvent {
            task_id: "t1".into(),
            context_id: "c1".into(),
            status: TaskStatus::new(TaskState::Completed),
            is_final: true,
            metadata: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["final"], serde_json::json!(true));
        assert_eq!(json["taskId"], serde_json::json!("t1"));
        let back: TaskStatusUpdateEvent = serde_json::from_value(json).unwrap();
        assert!(back.is_final);
    }

    #[test]
    fn part_kind_tags() {
        let part = Part::text("hi");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["kind"], serde_json::json!("text"));
        assert_eq!(json["text"], serde_json::json!("hi"));
    }
}
