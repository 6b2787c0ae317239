//! The agent-logic boundary.
//!
//! The lifecycle engine hands each task to a [`TaskProcessor`] and otherwise
//! treats it as opaque: the processor reports progress through its
//! [`TaskUpdater`] capability, polls the cancellation token, and finishes by
//! returning the final agent message (or an error, which fails the task).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Artifact, Message, Part, Task};
use crate::tasks::TaskUpdater;

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Process one task. Runs on its own runtime task; per-task ordering is
    /// guaranteed by the store underneath the updater.
    ///
    /// Returning `Ok` completes the task (unless it was parked via
    /// `require_input`/`require_auth` or canceled in the meantime);
    /// returning `Err` fails it with the error text as the status message.
    async fn process(
        &self,
        task: Task,
        updater: TaskUpdater,
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<Message>>;
}

/// Built-in processor: echoes the latest user text back as an artifact.
/// Stands in for real agent logic in the binary and the integration tests.
pub struct EchoProcessor;

#[async_trait]
impl TaskProcessor for EchoProcessor {
    async fn process(
        &self,
        task: Task,
        updater: TaskUpdater,
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<Message>> {
        let text: String = task
            .history
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::protocol::Role::User))
            .map(|m| {
                m.parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text, .. } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if cancel.is_cancelled() {
            return Ok(None);
        }

        updater
            .emit_artifact(
                Artifact {
                    artifact_id: uuid::Uuid::new_v4().to_string(),
                    name: Some("echo".to_string()),
                    description: None,
                    parts: vec![Part::text(text.clone())],
                    metadata: None,
                },
                false,
                true,
            )
            .await?;

        Ok(Some(Message::agent(
            &task.id,
            &task.context_id,
            vec![Part::text(format!("Echoed {} characters", text.len()))],
        )))
    }
}
