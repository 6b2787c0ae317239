//! Subscribable handle returned by `sendMessageStreaming`.
//!
//! Wraps exactly one task and (at most) one broker subscription. The broker
//! subscription opens lazily on the first attached callback, so no event is
//! lost while the creating RPC call is still in flight, and closes on
//! terminal delivery, disposal, or the monitoring timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::broker::{SubscriptionHandle, UpdateBroker, UpdateSubscriber};
use crate::error::A2aError;
use crate::protocol::{Task, TaskArtifactUpdateEvent, TaskStatusUpdateEvent};
use crate::tasks::TaskStore;

struct HandleState {
    task_id: String,
    callbacks: Mutex<Vec<Arc<dyn UpdateSubscriber>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    terminal: AtomicBool,
    timed_out: AtomicBool,
}

/// Fans the handle's single broker subscription out to every attached
/// callback. A callback that fails is detached; when none remain the
/// forwarder reports failure so the broker prunes the subscription.
struct Forwarder {
    state: Arc<HandleState>,
}

impl Forwarder {
    async fn fan_out<F, Fut>(&self, invoke_one: F) -> anyhow::Result<()>
    where
        F: Fn(Arc<dyn UpdateSubscriber>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let callbacks: Vec<Arc<dyn UpdateSubscriber>> = self
            .state
            .callbacks
            .lock()
            .expect("handle callbacks lock")
            .clone();

        let mut failed: Vec<usize> = Vec::new();
        for (index, callback) in callbacks.iter().enumerate() {
            if let Err(err) = invoke_one(Arc::clone(callback)).await {
                warn!(
                    task_id = %self.state.task_id,
                    err = %err,
                    "streaming callback failed — detaching"
                );
                failed.push(index);
            }
        }

        if !failed.is_empty() {
            let mut callbacks = self.state.callbacks.lock().expect("handle callbacks lock");
            for index in failed.into_iter().rev() {
                if index < callbacks.len() {
                    callbacks.remove(index);
                }
            }
            if callbacks.is_empty() {
                anyhow::bail!("all streaming callbacks failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateSubscriber for Forwarder {
    async fn on_status_update(&self, event: &TaskStatusUpdateEvent) -> anyhow::Result<()> {
        if event.is_final {
            self.state.terminal.store(true, Ordering::Release);
        }
        self.fan_out(|cb| {
            let event = event.clone();
            async move { cb.on_status_update(&event).await }
        })
        .await
    }

    async fn on_artifact_update(&self, event: &TaskArtifactUpdateEvent) -> anyhow::Result<()> {
        self.fan_out(|cb| {
            let event = event.clone();
            async move { cb.on_artifact_update(&event).await }
        })
        .await
    }
}

#[derive(Clone)]
pub struct StreamingTaskHandle {
    state: Arc<HandleState>,
    broker: Arc<UpdateBroker>,
    store: Arc<TaskStore>,
    monitoring_timeout: Duration,
}

impl StreamingTaskHandle {
    pub fn new(
        task_id: &str,
        broker: Arc<UpdateBroker>,
        store: Arc<TaskStore>,
        monitoring_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(HandleState {
                task_id: task_id.to_string(),
                callbacks: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
                terminal: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
            }),
            broker,
            store,
            monitoring_timeout,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.state.task_id
    }

    /// Attach a callback. The broker subscription (and its monitoring
    /// watchdog) opens on the first one.
    pub async fn subscribe(&self, callback: Arc<dyn UpdateSubscriber>) -> Result<(), A2aError> {
        self.state
            .callbacks
            .lock()
            .expect("handle callbacks lock")
            .push(callback);

        let needs_open = self
            .state
            .subscription
            .lock()
            .expect("handle subscription lock")
            .is_none();
        if !needs_open {
            return Ok(());
        }

        let forwarder = Arc::new(Forwarder {
            state: Arc::clone(&self.state),
        });
        let subscription = self.broker.subscribe(&self.state.task_id, forwarder).await?;
        {
            let mut slot = self
                .state
                .subscription
                .lock()
                .expect("handle subscription lock");
            if slot.is_some() {
                // Another caller opened concurrently; keep theirs.
                self.broker.unsubscribe(&subscription);
                return Ok(());
            }
            *slot = Some(subscription);
        }
        self.spawn_watchdog();
        Ok(())
    }

    /// Watchdog: a stream with no terminal event within the monitoring
    /// timeout is forcibly closed so abandoned tasks cannot pin
    /// subscriptions forever.
    fn spawn_watchdog(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(handle.monitoring_timeout).await;
            if handle.state.terminal.load(Ordering::Acquire) {
                return;
            }
            debug!(task_id = %handle.state.task_id, "streaming handle monitoring timeout");
            handle.state.timed_out.store(true, Ordering::Release);
            handle.state.terminal.store(true, Ordering::Release);
            handle.dispose();
        });
    }

    /// Current task snapshot.
    pub async fn task(&self) -> Result<Task, A2aError> {
        self.store.get(&self.state.task_id, None).await
    }

    /// Whether this handle has observed the terminal event (or timed out).
    pub fn is_final(&self) -> bool {
        self.state.terminal.load(Ordering::Acquire)
    }

    /// Whether the monitoring timeout closed the stream.
    pub fn timed_out(&self) -> bool {
        self.state.timed_out.load(Ordering::Acquire)
    }

    /// How many events overflowed the subscription queue.
    pub fn dropped_count(&self) -> u64 {
        self.state
            .subscription
            .lock()
            .expect("handle subscription lock")
            .as_ref()
            .map(|s| s.dropped_count())
            .unwrap_or(0)
    }

    /// Close the subscription and release every callback. Idempotent.
    pub fn dispose(&self) {
        let subscription = self
            .state
            .subscription
            .lock()
            .expect("handle subscription lock")
            .take();
        if let Some(subscription) = subscription {
            self.broker.unsubscribe(&subscription);
        }
        self.state
            .callbacks
            .lock()
            .expect("handle callbacks lock")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::status_event;
    use crate::protocol::{Message, Part, Role, TaskState, TaskStatus, UpdateEvent};
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

    fn user_message() -> Message {
        Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            context_id: None,
            task_id: None,
            role: Role::User,
            parts: vec![Part::text("hi")],
            metadata: None,
        }
    }

    async fn setup() -> (Arc<TaskStore>, Arc<UpdateBroker>, crate::protocol::Task) {
        let store = Arc::new(TaskStore::new());
        let task = store.create(user_message(), None).await;
        let broker = Arc::new(UpdateBroker::new(Arc::clone(&store), 64));
        (store, broker, task)
    }

    #[tokio::test]
    async fn lazy_subscription_and_fan_out() {
        let (store, broker, task) = setup().await;
        let handle = StreamingTaskHandle::new(
            &task.id,
            Arc::clone(&broker),
            Arc::clone(&store),
            Duration::from_secs(3600),
        );
        assert_eq!(broker.subscriber_count(&task.id), 0);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        handle
            .subscribe(Arc::new(ChannelSubscriber { tx: tx1 }))
            .await
            .unwrap();
        handle
            .subscribe(Arc::new(ChannelSubscriber { tx: tx2 }))
            .await
            .unwrap();
        // One broker subscription regardless of callback count.
        assert_eq!(broker.subscriber_count(&task.id), 1);

        broker.publish(status_event(
            &task.id,
            &task.context_id,
            TaskStatus::new(TaskState::Completed),
        ));

        // Both callbacks see snapshot + terminal.
        for rx in [&mut rx1, &mut rx2] {
            let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(!first.is_final());
            let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(second.is_final());
        }
        // Terminal observed; subscription pruned.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_final());
        assert!(!handle.timed_out());
    }

    #[tokio::test]
    async fn monitoring_timeout_closes_idle_stream() {
        let (store, broker, task) = setup().await;
        let handle = StreamingTaskHandle::new(
            &task.id,
            Arc::clone(&broker),
            Arc::clone(&store),
            Duration::from_millis(50),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        handle
            .subscribe(Arc::new(ChannelSubscriber { tx }))
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(&task.id), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(handle.timed_out());
        assert!(handle.is_final());
        assert_eq!(broker.subscriber_count(&task.id), 0);
    }

    #[tokio::test]
    async fn dispose_unsubscribes_and_clears() {
        let (store, broker, task) = setup().await;
        let handle = StreamingTaskHandle::new(
            &task.id,
            Arc::clone(&broker),
            Arc::clone(&store),
            Duration::from_secs(3600),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        handle
            .subscribe(Arc::new(ChannelSubscriber { tx }))
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(&task.id), 1);
        handle.dispose();
        handle.dispose(); // idempotent
        assert_eq!(broker.subscriber_count(&task.id), 0);
    }

    #[tokio::test]
    async fn task_snapshot_reflects_store() {
        let (store, broker, task) = setup().await;
        let handle = StreamingTaskHandle::new(
            &task.id,
            broker,
            Arc::clone(&store),
            Duration::from_secs(3600),
        );
        store
            .set_status(&task.id, TaskState::Working, None)
            .await
            .unwrap();
        let snapshot = handle.task().await.unwrap();
        assert_eq!(snapshot.status.state, TaskState::Working);
    }
}
