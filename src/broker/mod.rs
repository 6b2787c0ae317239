//! Per-task publish/subscribe hub.
//!
//! One topic per task. Publishing enqueues the event onto every
//! subscriber's bounded queue under the topic lock, so all subscribers of a
//! task observe the same relative order. Each subscription owns a delivery
//! worker that drains its queue and invokes the subscriber callback off the
//! lock; a slow subscriber therefore never stalls publishers or its peers.
//!
//! Delivery policy:
//! - Queue overflow drops the oldest non-terminal event and counts it.
//!   The terminal event is never dropped.
//! - A callback failure removes that subscription; other subscribers are
//!   unaffected.
//! - A topic closes after its terminal event; further publishes are silent
//!   no-ops.
//! - Late joiners always receive a snapshot event first, with `final`
//!   matching the task's state at subscribe time.

pub mod handle;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::A2aError;
use crate::protocol::{TaskArtifactUpdateEvent, TaskStatusUpdateEvent, UpdateEvent};
use crate::tasks::TaskStore;

pub use handle::StreamingTaskHandle;

/// The two-method capability a subscriber hands to the broker. For socket
/// clients the implementation crosses the connection; an `Err` from either
/// method is the signal that the subscriber is gone.
#[async_trait]
pub trait UpdateSubscriber: Send + Sync {
    async fn on_status_update(&self, event: &TaskStatusUpdateEvent) -> anyhow::Result<()>;
    async fn on_artifact_update(&self, event: &TaskArtifactUpdateEvent) -> anyhow::Result<()>;
}

async fn invoke(subscriber: &dyn UpdateSubscriber, event: &UpdateEvent) -> anyhow::Result<()> {
    match event {
        UpdateEvent::StatusUpdate(e) => subscriber.on_status_update(e).await,
        UpdateEvent::ArtifactUpdate(e) => subscriber.on_artifact_update(e).await,
    }
}

// ─── Subscription state ───────────────────────────────────────────────────────

struct QueueState {
    events: VecDeque<UpdateEvent>,
    dropped: u64,
    closed: bool,
    /// Once a final event is queued, everything after it is refused — a
    /// subscription delivers at most one final, and nothing follows it.
    final_enqueued: bool,
}

struct Subscription {
    id: u64,
    task_id: String,
    subscriber: Arc<dyn UpdateSubscriber>,
    queue: Mutex<QueueState>,
    notify: Notify,
    terminal_seen: AtomicBool,
}

impl Subscription {
    fn new(id: u64, task_id: &str, subscriber: Arc<dyn UpdateSubscriber>) -> Arc<Self> {
        Arc::new(Self {
            id,
            task_id: task_id.to_string(),
            subscriber,
            queue: Mutex::new(QueueState {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
                final_enqueued: false,
            }),
            notify: Notify::new(),
            terminal_seen: AtomicBool::new(false),
        })
    }

    /// Enqueue under the caller's topic lock. Overflow evicts the oldest
    /// non-terminal event; the terminal event always fits and is queued at
    /// most once per subscription.
    fn enqueue(&self, event: UpdateEvent, capacity: usize) {
        let mut queue = self.queue.lock().expect("subscription queue lock");
        if queue.closed || queue.final_enqueued {
            return;
        }
        if event.is_final() {
            queue.final_enqueued = true;
        }
        if queue.events.len() >= capacity {
            if let Some(pos) = queue.events.iter().position(|e| !e.is_final()) {
                queue.events.remove(pos);
                queue.dropped += 1;
            } else if !event.is_final() {
                // Queue is nothing but the terminal event; drop the newcomer.
                queue.dropped += 1;
                return;
            }
        }
        queue.events.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        let mut queue = self.queue.lock().expect("subscription queue lock");
        queue.closed = true;
        queue.events.clear();
        drop(queue);
        self.notify.notify_one();
    }
}

/// Keeps a subscription reachable for bookkeeping after the broker has
/// pruned it. Dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct SubscriptionHandle {
    sub: Arc<Subscription>,
}

impl SubscriptionHandle {
    pub fn task_id(&self) -> &str {
        &self.sub.task_id
    }

    /// How many events overflowed this subscriber's queue.
    pub fn dropped_count(&self) -> u64 {
        self.sub.queue.lock().expect("subscription queue lock").dropped
    }

    /// Whether the terminal event has been delivered to this subscriber.
    pub fn terminal_seen(&self) -> bool {
        self.sub.terminal_seen.load(Ordering::Acquire)
    }
}

// ─── Broker ───────────────────────────────────────────────────────────────────

struct Topic {
    closed: bool,
    subs: HashMap<u64, Arc<Subscription>>,
}

type SharedTopics = Arc<Mutex<HashMap<String, Topic>>>;

pub struct UpdateBroker {
    store: Arc<TaskStore>,
    queue_capacity: usize,
    topics: SharedTopics,
    next_id: AtomicU64,
}

impl UpdateBroker {
    pub fn new(store: Arc<TaskStore>, queue_capacity: usize) -> Self {
        Self {
            store,
            queue_capacity: queue_capacity.max(1),
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Broadcast `event` to every current subscriber of its task. A
    /// terminal event closes the topic; publishing to a closed topic is a
    /// silent no-op.
    pub fn publish(&self, event: UpdateEvent) {
        let task_id = event.task_id().to_string();
        let mut topics = self.topics.lock().expect("broker topics lock");
        let Some(topic) = topics.get_mut(&task_id) else {
            // Nobody is listening; nothing to deliver.
            return;
        };
        if topic.closed {
            debug!(task_id = %task_id, "publish on closed topic ignored");
            return;
        }
        if event.is_final() {
            topic.closed = true;
        }
        for sub in topic.subs.values() {
            sub.enqueue(event.clone(), self.queue_capacity);
        }
    }

    /// Register a callback for a task's updates.
    ///
    /// Always delivers at least one event: a snapshot of the current status
    /// whose `final` flag matches the task's state at subscribe time. If the
    /// task is already final the snapshot is the only event and the
    /// subscription closes itself after delivering it.
    pub async fn subscribe(
        &self,
        task_id: &str,
        subscriber: Arc<dyn UpdateSubscriber>,
    ) -> Result<SubscriptionHandle, A2aError> {
        let task = self.store.get(task_id, Some(0)).await?;
        let snapshot = UpdateEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            status: task.status.clone(),
            is_final: task.is_final(),
            metadata: None,
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscription::new(id, task_id, subscriber);

        if task.is_final() {
            // Closed stream: the snapshot is the only event this
            // subscription will ever receive.
            sub.enqueue(snapshot, self.queue_capacity);
            spawn_delivery_worker(Arc::clone(&sub), Arc::clone(&self.topics));
            return Ok(SubscriptionHandle { sub });
        }

        // Enqueue the snapshot and register under the same topic lock so no
        // concurrently published event can land ahead of the snapshot.
        let raced_terminal = {
            let mut topics = self.topics.lock().expect("broker topics lock");
            let topic = topics.entry(task_id.to_string()).or_insert_with(|| Topic {
                closed: false,
                subs: HashMap::new(),
            });
            if topic.closed {
                true
            } else {
                sub.enqueue(snapshot, self.queue_capacity);
                topic.subs.insert(id, Arc::clone(&sub));
                false
            }
        };

        // Re-read finality after the registration attempt. Two races end
        // here: the topic was already closed (`raced_terminal`), or the
        // terminal was published while no topic existed yet — a no-op in
        // `publish` that never set `closed`, leaving this subscription with
        // only the stale non-final snapshot. Either way the store committed
        // the final state before that publish, so a refreshed snapshot
        // carries `final = true`; the once-only guard in `enqueue` keeps
        // this from doubling up with a terminal that does get delivered.
        if let Ok(task) = self.store.get(task_id, Some(0)).await {
            if raced_terminal || task.is_final() {
                sub.enqueue(
                    UpdateEvent::StatusUpdate(TaskStatusUpdateEvent {
                        task_id: task.id.clone(),
                        context_id: task.context_id.clone(),
                        status: task.status.clone(),
                        is_final: task.is_final(),
                        metadata: None,
                    }),
                    self.queue_capacity,
                );
            }
        }

        spawn_delivery_worker(Arc::clone(&sub), Arc::clone(&self.topics));
        Ok(SubscriptionHandle { sub })
    }

    /// Remove a subscription. Idempotent; pending undelivered events are
    /// discarded.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        remove_subscription(&self.topics, &handle.sub);
    }

    /// Current subscriber count for a task (diagnostics and tests).
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.topics
            .lock()
            .expect("broker topics lock")
            .get(task_id)
            .map(|t| t.subs.len())
            .unwrap_or(0)
    }
}

fn remove_subscription(topics: &SharedTopics, sub: &Arc<Subscription>) {
    let mut topics = topics.lock().expect("broker topics lock");
    if let Some(topic) = topics.get_mut(&sub.task_id) {
        topic.subs.remove(&sub.id);
        if topic.subs.is_empty() {
            topics.remove(&sub.task_id);
        }
    }
    sub.close();
}

/// One worker per subscription: drain the queue in order, invoke the
/// callback off every lock, prune the subscription on terminal delivery or
/// callback failure.
fn spawn_delivery_worker(sub: Arc<Subscription>, topics: SharedTopics) {
    tokio::spawn(async move {
        loop {
            let next = {
                let mut queue = sub.queue.lock().expect("subscription queue lock");
                if queue.closed {
                    break;
                }
                queue.events.pop_front()
            };

            match next {
                Some(event) => {
                    let is_final = event.is_final();
                    if let Err(err) = invoke(&*sub.subscriber, &event).await {
                        warn!(
                            task_id = %sub.task_id,
                            err = %err,
                            "subscriber callback failed — unsubscribing"
                        );
                        remove_subscription(&topics, &sub);
                        break;
                    }
                    if is_final {
                        sub.terminal_seen.store(true, Ordering::Release);
                        remove_subscription(&topics, &sub);
                        break;
                    }
                }
                None => sub.notify.notified().await,
            }
        }
    });
}

// ─── Event constructors ───────────────────────────────────────────────────────

/// Build a status event for a task snapshot. `final` mirrors the state.
pub fn status_event(
    task_id: &str,
    context_id: &str,
    status: crate::protocol::TaskStatus,
) -> UpdateEvent {
    let is_final = status.state.is_final();
    UpdateEvent::StatusUpdate(TaskStatusUpdateEvent {
        task_id: task_id.to_string(),
        context_id: context_id.to_string(),
        status,
        is_final,
        metadata: None,
    })
}

/// Build an artifact event.
pub fn artifact_event(
    task_id: &str,
    context_id: &str,
    artifact: crate::protocol::Artifact,
    append: bool,
    last_chunk: bool,
) -> UpdateEvent {
    UpdateEvent::ArtifactUpdate(TaskArtifactUpdateEvent {
        task_id: task_id.to_string(),
        context_id: context_id.to_string(),
        artifact,
        append: append.then_some(true),
        last_chunk: last_chunk.then_some(true),
    })
}
