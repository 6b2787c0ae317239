//! Task lifecycle engine.
//!
//! Sits atop [`TaskStore`] and [`UpdateBroker`]: drives the state machine,
//! delegates the body of each task to the configured
//! [`TaskProcessor`](crate::processor::TaskProcessor), and publishes every
//! status and artifact change.
//!
//! The automatic `submitted → working` transition is emitted after
//! [`TaskLifecycle::submit`] has returned, so a subscriber attached between
//! creation and startup still observes `working`. Exactly one terminal
//! event is published per task: the store's transition table arbitrates
//! races between processor completion and external cancel, and the losing
//! side publishes nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{artifact_event, status_event, UpdateBroker};
use crate::error::A2aError;
use crate::processor::TaskProcessor;
use crate::protocol::{Artifact, Message, Part, Task, TaskState};
use crate::tasks::TaskStore;

/// Capability handed to the processor for reporting progress on one task.
/// Every mutation goes through the store (per-task serialization) and is
/// broadcast to subscribers.
#[derive(Clone)]
pub struct TaskUpdater {
    store: Arc<TaskStore>,
    broker: Arc<UpdateBroker>,
    task_id: String,
    context_id: String,
}

impl TaskUpdater {
    /// Append an agent message to the task history.
    pub async fn add_message(&self, parts: Vec<Part>) -> Result<Message, A2aError> {
        let message = Message::agent(&self.task_id, &self.context_id, parts);
        self.store
            .append_history(&self.task_id, message.clone())
            .await?;
        Ok(message)
    }

    /// Record an artifact (or extend one with `append`) and broadcast it.
    pub async fn emit_artifact(
        &self,
        artifact: Artifact,
        append: bool,
        last_chunk: bool,
    ) -> Result<(), A2aError> {
        self.store
            .append_artifact(&self.task_id, artifact.clone(), append)
            .await?;
        self.broker.publish(artifact_event(
            &self.task_id,
            &self.context_id,
            artifact,
            append,
            last_chunk,
        ));
        Ok(())
    }

    /// Pause the task waiting for client input.
    pub async fn require_input(&self, message: Option<Message>) -> Result<(), A2aError> {
        self.pause(TaskState::InputRequired, message).await
    }

    /// Pause the task waiting for authentication.
    pub async fn require_auth(&self, message: Option<Message>) -> Result<(), A2aError> {
        self.pause(TaskState::AuthRequired, message).await
    }

    async fn pause(&self, state: TaskState, message: Option<Message>) -> Result<(), A2aError> {
        let task = self.store.set_status(&self.task_id, state, message).await?;
        self.broker
            .publish(status_event(&task.id, &task.context_id, task.status));
        Ok(())
    }
}

pub struct TaskLifecycle {
    store: Arc<TaskStore>,
    broker: Arc<UpdateBroker>,
    processor: Arc<dyn TaskProcessor>,
    /// Live cancellation tokens, one per running task.
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskLifecycle {
    pub fn new(
        store: Arc<TaskStore>,
        broker: Arc<UpdateBroker>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self {
            store,
            broker,
            processor,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<UpdateBroker> {
        &self.broker
    }

    /// Create a task in `submitted` without starting it. Streaming callers
    /// attach their subscription between this and [`Self::start`].
    pub async fn submit(
        &self,
        message: Message,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Task {
        self.store.create(message, metadata).await
    }

    /// Begin processing: auto-transition to `working` and hand the task to
    /// the processor on a fresh runtime task.
    pub fn start(self: &Arc<Self>, task_id: &str) {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel map lock")
            .insert(task_id.to_string(), token.clone());
        let lifecycle = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            lifecycle.run(task_id, token).await;
        });
    }

    /// Create and immediately start a task (the non-streaming path).
    /// Returns the `submitted` snapshot; `working` is published afterwards.
    pub async fn send(
        self: &Arc<Self>,
        message: Message,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<Task, A2aError> {
        match message.task_id.clone() {
            Some(task_id) => self.follow_up(&task_id, message).await,
            None => {
                let task = self.submit(message, metadata).await;
                self.start(&task.id);
                Ok(task)
            }
        }
    }

    /// Route a message at an existing task: append it to history, and if
    /// the task was waiting on the client, resume it to `working`.
    pub async fn follow_up(
        self: &Arc<Self>,
        task_id: &str,
        mut message: Message,
    ) -> Result<Task, A2aError> {
        let current = self.store.get(task_id, Some(0)).await?;
        if current.is_final() {
            return Err(A2aError::Conflict(format!(
                "task {task_id} is already {}",
                current.status.state
            )));
        }

        message.task_id = Some(current.id.clone());
        message.context_id = Some(current.context_id.clone());
        let task = self.store.append_history(task_id, message).await?;

        if current.status.state.is_interrupted() {
            // start() re-runs the processor; its `→ working` transition is
            // published from there, like the initial auto-transition.
            self.start(task_id);
        }
        Ok(task)
    }

    /// Cancel a non-final task: transition, publish the terminal event, and
    /// signal the in-flight processor. The processor's late completion is
    /// ignored (its transition attempt hits `CONFLICT` and publishes
    /// nothing).
    pub async fn cancel(&self, task_id: &str) -> Result<Task, A2aError> {
        let task = self.store.cancel(task_id, None).await?;
        info!(task_id = %task_id, "task canceled");
        self.broker
            .publish(status_event(&task.id, &task.context_id, task.status.clone()));
        if let Some(token) = self.cancels.lock().expect("cancel map lock").remove(task_id) {
            token.cancel();
        }
        Ok(task)
    }

    async fn run(self: Arc<Self>, task_id: String, token: CancellationToken) {
        // Auto-transition. A cancel that won the race leaves nothing to do.
        let task = match self
            .store
            .set_status(&task_id, TaskState::Working, None)
            .await
        {
            Ok(task) => {
                self.broker.publish(status_event(
                    &task.id,
                    &task.context_id,
                    task.status.clone(),
                ));
                task
            }
            Err(err) => {
                debug!(task_id = %task_id, err = %err, "task not started");
                self.cancels.lock().expect("cancel map lock").remove(&task_id);
                return;
            }
        };

        let updater = TaskUpdater {
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
        };

        tokio::select! {
            _ = token.cancelled() => {
                // cancel() already published the terminal event.
                debug!(task_id = %task_id, "processor preempted by cancel");
            }
            result = self.processor.process(task.clone(), updater, token.clone()) => {
                match result {
                    Ok(message) => self.finish(&task_id, TaskState::Completed, message).await,
                    Err(err) => {
                        warn!(task_id = %task_id, err = %err, "processor failed");
                        let message =
                            Message::agent(&task.id, &task.context_id, vec![Part::text(err.to_string())]);
                        self.finish(&task_id, TaskState::Failed, Some(message)).await;
                    }
                }
            }
        }

        self.cancels.lock().expect("cancel map lock").remove(&task_id);
    }

    /// Attempt a terminal transition and publish it. `CONFLICT` means the
    /// task went final through another path (cancel) or is waiting on the
    /// client (`input-required` / `auth-required`) — either way the
    /// processor's outcome is dropped without an event.
    async fn finish(&self, task_id: &str, state: TaskState, message: Option<Message>) {
        match self.store.set_status(task_id, state, message).await {
            Ok(task) => {
                info!(task_id = %task_id, state = %state, "task finished");
                self.broker
                    .publish(status_event(&task.id, &task.context_id, task.status));
            }
            Err(A2aError::Conflict(_)) => {
                debug!(task_id = %task_id, state = %state, "terminal transition superseded");
            }
            Err(err) => {
                warn!(task_id = %task_id, err = %err, "terminal transition failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::UpdateSubscriber;
    use crate::protocol::{Role, TaskArtifactUpdateEvent, TaskStatusUpdateEvent, UpdateEvent};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelSubscriber {
        tx: mpsc::UnboundedSender<UpdateEvent>,
    }

    #[async_trait]
    impl UpdateSubscriber for ChannelSubscriber {
        async fn on_status_update(&self, event: &TaskStatusUpdateEvent) -> anyhow::Result<()> {
            self.tx.send(UpdateEvent::StatusUpdate(event.clone()))?;
            Ok(())
        }
        async fn on_artifact_update(&self, event: &TaskArtifactUpdateEvent) -> anyhow::Result<()> {
            self.tx.send(UpdateEvent::ArtifactUpdate(event.clone()))?;
            Ok(())
        }
    }

    /// Processor that emits one artifact then completes.
    struct OneShotProcessor;

    #[async_trait]
    impl TaskProcessor for OneShotProcessor {
        async fn process(
            &self,
            task: Task,
            updater: TaskUpdater,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Option<Message>> {
            updater
                .emit_artifact(
                    Artifact {
                        artifact_id: "out".into(),
                        name: None,
                        description: None,
                        parts: vec![Part::text("result")],
                        metadata: None,
                    },
                    false,
                    true,
                )
                .await?;
            Ok(Some(Message::agent(
                &task.id,
                &task.context_id,
                vec![Part::text("done")],
            )))
        }
    }

    /// Processor that never finishes on its own.
    struct HangingProcessor;

    #[async_trait]
    impl TaskProcessor for HangingProcessor {
        async fn process(
            &self,
            _task: Task,
            _updater: TaskUpdater,
            cancel: CancellationToken,
        ) -> anyhow::Result<Option<Message>> {
            cancel.cancelled().await;
            Ok(None)
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl TaskProcessor for FailingProcessor {
        async fn process(
            &self,
            _task: Task,
            _updater: TaskUpdater,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Option<Message>> {
            anyhow::bail!("tool exploded")
        }
    }

    fn user_message(text: &str) -> Message {
        Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            context_id: None,
            task_id: None,
            role: Role::User,
            parts: vec![Part::text(text)],
            metadata: None,
        }
    }

    fn lifecycle_with(processor: Arc<dyn TaskProcessor>) -> Arc<TaskLifecycle> {
        let store = Arc::new(TaskStore::new());
        let broker = Arc::new(UpdateBroker::new(Arc::clone(&store), 64));
        Arc::new(TaskLifecycle::new(store, broker, processor))
    }

    async fn drain_until_final(
        rx: &mut mpsc::UnboundedReceiver<UpdateEvent>,
    ) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event within deadline")
                .expect("channel open");
            let is_final = event.is_final();
            events.push(event);
            if is_final {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn submit_then_start_streams_working_and_completed() {
        let lifecycle = lifecycle_with(Arc::new(OneShotProcessor));
        let task = lifecycle.submit(user_message("hi"), None).await;
        assert_eq!(task.status.state, TaskState::Submitted);

        let (tx, mut rx) = mpsc::unbounded_channel();
        lifecycle
            .broker()
            .subscribe(&task.id, Arc::new(ChannelSubscriber { tx }))
            .await
            .unwrap();
        lifecycle.start(&task.id);

        let events = drain_until_final(&mut rx).await;
        let states: Vec<TaskState> = events
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::StatusUpdate(s) => Some(s.status.state),
                UpdateEvent::ArtifactUpdate(_) => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![TaskState::Submitted, TaskState::Working, TaskState::Completed]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, UpdateEvent::ArtifactUpdate(_))));
        // Ids are stable across every event.
        assert!(events.iter().all(|e| e.task_id() == task.id));
        assert!(events.iter().all(|e| e.context_id() == task.context_id));
    }

    #[tokio::test]
    async fn cancel_preempts_processor_and_publishes_terminal() {
        let lifecycle = lifecycle_with(Arc::new(HangingProcessor));
        let task = lifecycle.submit(user_message("hi"), None).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        lifecycle
            .broker()
            .subscribe(&task.id, Arc::new(ChannelSubscriber { tx }))
            .await
            .unwrap();
        lifecycle.start(&task.id);

        // Let the auto-transition land first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let canceled = lifecycle.cancel(&task.id).await.unwrap();
        assert_eq!(canceled.status.state, TaskState::Canceled);

        let events = drain_until_final(&mut rx).await;
        match events.last().unwrap() {
            UpdateEvent::StatusUpdate(s) => {
                assert_eq!(s.status.state, TaskState::Canceled);
                assert!(s.is_final);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Second cancel conflicts.
        assert!(matches!(
            lifecycle.cancel(&task.id).await,
            Err(A2aError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn processor_failure_publishes_failed_with_reason() {
        let lifecycle = lifecycle_with(Arc::new(FailingProcessor));
        let task = lifecycle.submit(user_message("hi"), None).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        lifecycle
            .broker()
            .subscribe(&task.id, Arc::new(ChannelSubscriber { tx }))
            .await
            .unwrap();
        lifecycle.start(&task.id);

        let events = drain_until_final(&mut rx).await;
        match events.last().unwrap() {
            UpdateEvent::StatusUpdate(s) => {
                assert_eq!(s.status.state, TaskState::Failed);
                let text = match &s.status.message.as_ref().unwrap().parts[0] {
                    Part::Text { text, .. } => text.clone(),
                    other => panic!("unexpected {other:?}"),
                };
                assert!(text.contains("tool exploded"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn follow_up_resumes_waiting_task() {
        /// Waits for input on the first run, completes on the second.
        struct TwoPhaseProcessor;

        #[async_trait]
        impl TaskProcessor for TwoPhaseProcessor {
            async fn process(
                &self,
                task: Task,
                updater: TaskUpdater,
                _cancel: CancellationToken,
            ) -> anyhow::Result<Option<Message>> {
                if task.history.len() < 2 {
                    updater.require_input(None).await?;
                    return Ok(None);
                }
                Ok(Some(Message::agent(
                    &task.id,
                    &task.context_id,
                    vec![Part::text("all set")],
                )))
            }
        }

        let lifecycle = lifecycle_with(Arc::new(TwoPhaseProcessor));
        let task = lifecycle.send(user_message("step 1"), None).await.unwrap();

        // Wait for the processor to park the task.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let t = lifecycle.store().get(&task.id, Some(0)).await.unwrap();
            if t.status.state == TaskState::InputRequired {
                break;
            }
        }
        let parked = lifecycle.store().get(&task.id, Some(0)).await.unwrap();
        assert_eq!(parked.status.state, TaskState::InputRequired);

        let mut follow = user_message("step 2");
        follow.task_id = Some(task.id.clone());
        let resumed = lifecycle.send(follow, None).await.unwrap();
        assert_eq!(resumed.history.len(), 2);

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let t = lifecycle.store().get(&task.id, Some(0)).await.unwrap();
            if t.status.state == TaskState::Completed {
                return;
            }
        }
        panic!("task never completed after resume");
    }

    #[tokio::test]
    async fn follow_up_to_final_task_is_conflict() {
        let lifecycle = lifecycle_with(Arc::new(OneShotProcessor));
        let task = lifecycle.send(user_message("hi"), None).await.unwrap();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if lifecycle
                .store()
                .get(&task.id, Some(0))
                .await
                .unwrap()
                .is_final()
            {
                break;
            }
        }
        let mut follow = user_message("more");
        follow.task_id = Some(task.id.clone());
        assert!(matches!(
            lifecycle.send(follow, None).await,
            Err(A2aError::Conflict(_))
        ));
    }
}
