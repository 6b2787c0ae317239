//! Property tests for the lifecycle and broker invariants.

use std::sync::Arc;

use a2ad::broker::{status_event, UpdateBroker, UpdateSubscriber};
use a2ad::protocol::{
    Message, Part, Role, TaskArtifactUpdateEvent, TaskState, TaskStatus, TaskStatusUpdateEvent,
    UpdateEvent,
};
use a2ad::tasks::TaskStore;
use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::mpsc;

const ALL_STATES: [TaskState; 8] = [
    TaskState::Submitted,
    TaskState::Working,
    TaskState::InputRequired,
    TaskState::AuthRequired,
    TaskState::Completed,
    TaskState::Canceled,
    TaskState::Failed,
    TaskState::Rejected,
];

fn state_strategy() -> impl Strategy<Value = TaskState> {
    (0..ALL_STATES.len()).prop_map(|i| ALL_STATES[i])
}

fn user_message() -> Message {
    Message {
        message_id: uuid::Uuid::new_v4().to_string(),
        context_id: None,
        task_id: None,
        role: Role::User,
        parts: vec![Part::text("prop")],
        metadata: None,
    }
}

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

proptest! {
    /// No sequence of attempted transitions ever leaves a final state.
    #[test]
    fn no_transition_escapes_final(attempts in proptest::collection::vec(state_strategy(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = TaskStore::new();
            let task = store.create(user_message(), None).await;
            let mut reached_final = false;

            for state in attempts {
                let before = store.get(&task.id, Some(0)).await.unwrap().status.state;
                let result = store.set_status(&task.id, state, None).await;
                let after = store.get(&task.id, Some(0)).await.unwrap().status.state;

                if reached_final {
                    prop_assert!(result.is_err(), "transition accepted out of final state");
                    prop_assert_eq!(before, after, "final state mutated");
                }
                if result.is_ok() {
                    prop_assert!(before.can_transition(state));
                    prop_assert_eq!(after, state);
                } else {
                    prop_assert_eq!(before, after, "failed transition mutated state");
                }
                if after.is_final() {
                    reached_final = true;
                }
            }
            Ok(())
        })?;
    }

    /// Every subscriber of a task observes the same event order, at most one
    /// final event, and nothing after it.
    #[test]
    fn subscribers_agree_on_order_and_terminality(
        middle in proptest::collection::vec(state_strategy(), 0..20),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = Arc::new(TaskStore::new());
            let task = store.create(user_message(), None).await;
            let broker = UpdateBroker::new(Arc::clone(&store), 256);

            let (tx1, mut rx1) = mpsc::unbounded_channel();
            let (tx2, mut rx2) = mpsc::unbounded_channel();
            broker.subscribe(&task.id, Arc::new(ChannelSubscriber { tx: tx1 })).await.unwrap();
            broker.subscribe(&task.id, Arc::new(ChannelSubscriber { tx: tx2 })).await.unwrap();

            // Publish an arbitrary run of non-final events, then a terminal,
            // then noise that must be swallowed.
            for state in &middle {
                let state = if state.is_final() { TaskState::Working } else { *state };
                broker.publish(status_event(&task.id, &task.context_id, TaskStatus::new(state)));
            }
            broker.publish(status_event(
                &task.id,
                &task.context_id,
                TaskStatus::new(TaskState::Completed),
            ));
            broker.publish(status_event(
                &task.id,
                &task.context_id,
                TaskStatus::new(TaskState::Working),
            ));

            let expected = middle.len() + 2; // snapshot + middle + terminal
            let mut events1 = Vec::new();
            let mut events2 = Vec::new();
            for _ in 0..expected {
                events1.push(
                    tokio::time::timeout(std::time::Duration::from_secs(2), rx1.recv())
                        .await
                        .expect("subscriber 1 event")
                        .unwrap(),
                );
                events2.push(
                    tokio::time::timeout(std::time::Duration::from_secs(2), rx2.recv())
                        .await
                        .expect("subscriber 2 event")
                        .unwrap(),
                );
            }

            prop_assert_eq!(&events1, &events2, "subscribers diverged");
            let finals = events1.iter().filter(|e| e.is_final()).count();
            prop_assert_eq!(finals, 1, "expected exactly one terminal event");
            prop_assert!(events1.last().unwrap().is_final(), "terminal not last");
            prop_assert!(
                events1.iter().all(|e| e.task_id() == task.id),
                "task id drifted"
            );
            Ok(())
        })?;
    }
}
