// ── Broker task ──
//
// One loop, two inputs: registration control messages and publishes. The
// loop is biased toward control so a subscription queued before a publish
// is always registered before that publish is routed. Deliveries go onto
// unbounded channels and never block the loop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_core::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::publisher::Publisher;
use super::topic::Topic;
use super::trie::TopicTrie;

/// Handle used to cancel a subscription.
pub type SubscriptionId = u64;

/// Payload filter evaluated by the broker before delivery.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A published message. Immutable once handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PubSubMessage {
    pub topic: Topic,
    pub value: Value,
}

enum Control {
    Subscribe {
        id: SubscriptionId,
        topic: Topic,
        predicate: Option<Predicate>,
        tx: mpsc::UnboundedSender<Arc<PubSubMessage>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

struct Entry {
    topic: Topic,
    predicate: Option<Predicate>,
    tx: mpsc::UnboundedSender<Arc<PubSubMessage>>,
}

// ── Handle ──────────────────────────────────────────────────────────

struct HandleInner {
    control_tx: mpsc::UnboundedSender<Control>,
    publish_tx: mpsc::UnboundedSender<PubSubMessage>,
    next_id: AtomicU64,
}

/// Cheaply cloneable access point to a running [`Broker`].
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<HandleInner>,
}

impl BrokerHandle {
    /// Register interest in `topic` and everything below it.
    ///
    /// The id is allocated locally so this never waits on the broker.
    pub fn subscribe(&self, topic: Topic, predicate: Option<Predicate>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Control::Subscribe {
            id,
            topic,
            predicate,
            tx,
        };
        if self.inner.control_tx.send(control).is_err() {
            trace!(id, "broker gone, subscription will never fire");
        }
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Cancel by raw id. Unknown ids are logged by the broker and ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.inner.control_tx.send(Control::Unsubscribe { id });
    }

    pub fn publish(&self, topic: Topic, value: Value) {
        if self
            .inner
            .publish_tx
            .send(PubSubMessage { topic, value })
            .is_err()
        {
            trace!("broker gone, dropping publish");
        }
    }

    /// A publisher that prefixes every topic with `prefix`.
    pub fn publisher(&self, prefix: Topic) -> Publisher {
        Publisher::new(self.clone(), prefix)
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Arc<PubSubMessage>>,
    bus: BrokerHandle,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next matching message, or `None` once the broker has shut down.
    pub async fn recv(&mut self) -> Option<Arc<PubSubMessage>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<PubSubMessage>> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe now. Consumes the handle, so it cannot run twice.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl Stream for Subscription {
    type Item = Arc<PubSubMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── Broker ──────────────────────────────────────────────────────────

/// Sole owner of the subscription registry.
pub struct Broker {
    control_rx: mpsc::UnboundedReceiver<Control>,
    publish_rx: mpsc::UnboundedReceiver<PubSubMessage>,
    trie: TopicTrie,
    registry: HashMap<SubscriptionId, Entry>,
}

impl Broker {
    /// Start the broker loop on the current runtime.
    pub fn spawn(cancel: CancellationToken) -> (BrokerHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let handle = BrokerHandle {
            inner: Arc::new(HandleInner {
                control_tx,
                publish_tx,
                next_id: AtomicU64::new(1),
            }),
        };
        let broker = Self {
            control_rx,
            publish_rx,
            trie: TopicTrie::default(),
            registry: HashMap::new(),
        };
        let task = tokio::spawn(broker.run(cancel));
        (handle, task)
    }

    async fn run(mut self, cancel: CancellationToken) {
        debug!("pub/sub broker started");
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                control = self.control_rx.recv() => match control {
                    Some(control) => self.apply(control),
                    None => break,
                },

                message = self.publish_rx.recv() => match message {
                    Some(message) => self.route(message),
                    None => break,
                },
            }
        }
        debug!(
            subscriptions = self.registry.len(),
            idle = self.trie.is_empty(),
            "pub/sub broker stopped"
        );
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Subscribe {
                id,
                topic,
                predicate,
                tx,
            } => {
                trace!(id, %topic, "subscribe");
                self.trie.insert(&topic, id);
                self.registry.insert(
                    id,
                    Entry {
                        topic,
                        predicate,
                        tx,
                    },
                );
            }
            Control::Unsubscribe { id } => self.remove(id),
        }
    }

    fn remove(&mut self, id: SubscriptionId) {
        match self.registry.remove(&id) {
            Some(entry) => {
                trace!(id, topic = %entry.topic, "unsubscribe");
                self.trie.remove(&entry.topic, id);
            }
            None => warn!(id, "unsubscribe for unknown subscription"),
        }
    }

    fn route(&mut self, message: PubSubMessage) {
        let message = Arc::new(message);
        let mut closed = Vec::new();
        for id in self.trie.matching(&message.topic) {
            let Some(entry) = self.registry.get(&id) else {
                continue;
            };
            if let Some(ref accept) = entry.predicate {
                if !accept(&message.value) {
                    continue;
                }
            }
            if entry.tx.send(Arc::clone(&message)).is_err() {
                closed.push(id);
            }
        }
        trace!(topic = %message.topic, "published");
        // Receivers dropped without an unsubscribe reaching us yet.
        for id in closed {
            if let Some(entry) = self.registry.remove(&id) {
                self.trie.remove(&entry.topic, id);
            }
        }
    }
}
