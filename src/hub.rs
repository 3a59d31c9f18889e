//! The broadcast hub: a single control loop that owns every live subscriber.
//!
//! All registry changes and all fan-out go through one task, fed by one
//! channel of [`HubMessage`]s. Nothing else ever touches the registry, so it
//! needs no locking, and a publish can never interleave with a subscribe or an
//! unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::reader::LineBatch;
use crate::subscriber::{Frame, Outbound, Subscriber, SubscriberId, Transport};

/// Default per-subscriber queue capacity, in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default capacity of the hub's inbound message channel.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HubConfig {
    /// Frames a subscriber may fall behind by before it is evicted.
    pub queue_capacity: usize,
    /// Messages that may wait for the control loop before senders block.
    pub inbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

/// Messages handled by the hub control loop.
pub(crate) enum HubMessage {
    Subscribe(Subscriber),
    Unsubscribe(SubscriberId),
    Publish(Frame),
    Subscribers {
        respond_to: oneshot::Sender<Vec<SubscriberId>>,
    },
}

/// The hub control loop. Construct it with [`BroadcastHub::spawn`] and talk
/// to it through the returned [`HubHandle`].
pub struct BroadcastHub {
    receiver: mpsc::Receiver<HubMessage>,
    registry: HashMap<SubscriberId, Subscriber>,
}

impl BroadcastHub {
    /// Starts the control loop on its own task.
    ///
    /// The loop stops once every `HubHandle` is dropped; remaining subscribers
    /// then see their queues close.
    pub fn spawn(config: HubConfig) -> HubHandle {
        Self::spawn_with_task(config).0
    }

    /// Like [`spawn`](BroadcastHub::spawn), also returning the control loop's
    /// task.
    pub fn spawn_with_task(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.inbox_capacity.max(1));

        let hub = BroadcastHub {
            receiver,
            registry: HashMap::new(),
        };
        let task = tokio::spawn(hub.run());

        let handle = HubHandle {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: config.queue_capacity.max(1),
        };

        (handle, task)
    }

    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            self.handle_message(msg);
        }

        debug!(subscribers = self.registry.len(), "hub stopped");
    }

    fn handle_message(&mut self, msg: HubMessage) {
        match msg {
            HubMessage::Subscribe(subscriber) => self.subscribe(subscriber),
            HubMessage::Unsubscribe(id) => self.unsubscribe(id),
            HubMessage::Publish(frame) => self.publish(frame),
            HubMessage::Subscribers { respond_to } => {
                let mut ids: Vec<_> = self.registry.keys().copied().collect();
                ids.sort();
                let _ = respond_to.send(ids);
            }
        }
    }

    fn subscribe(&mut self, subscriber: Subscriber) {
        let id = subscriber.id();
        if self.registry.contains_key(&id) {
            warn!(subscriber = %id, "ignoring duplicate subscribe");
            return;
        }

        debug!(subscriber = %id, "subscribed");
        self.registry.insert(id, subscriber);
    }

    fn unsubscribe(&mut self, id: SubscriberId) {
        // Dropping the registry entry drops the queue's only sender, which
        // ends the subscriber's drain loop.
        if self.registry.remove(&id).is_some() {
            debug!(subscriber = %id, "unsubscribed");
        }
    }

    fn publish(&mut self, frame: Frame) {
        self.registry
            .retain(|id, subscriber| match subscriber.try_enqueue(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "queue full, evicting slow subscriber");
                    subscriber.close_transport();
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "queue closed, dropping subscriber");
                    false
                }
            });
    }
}

/// Cheaply cloneable handle to a running [`BroadcastHub`].
#[derive(Clone, Debug)]
pub struct HubHandle {
    sender: mpsc::Sender<HubMessage>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl HubHandle {
    /// Creates a subscriber for `transport`, along with the receiving end of
    /// its bounded queue. Nothing is registered until
    /// [`subscribe`](HubHandle::subscribe).
    pub fn new_subscriber(&self, transport: Arc<dyn Transport>) -> (Subscriber, Outbound) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Subscriber::new(id, self.queue_capacity, transport)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    async fn send(&self, msg: HubMessage) -> Result<()> {
        self.sender.send(msg).await.map_err(|_| Error::HubClosed)
    }

    pub async fn subscribe(&self, subscriber: Subscriber) -> Result<()> {
        self.send(HubMessage::Subscribe(subscriber)).await
    }

    /// Removes the subscriber and closes its queue. Unknown or already removed
    /// ids are ignored.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<()> {
        self.send(HubMessage::Unsubscribe(id)).await
    }

    /// Fans `text` out to every registered subscriber as a single frame.
    pub async fn publish(&self, text: impl Into<Frame>) -> Result<()> {
        self.send(HubMessage::Publish(text.into())).await
    }

    pub async fn publish_batch(&self, batch: &LineBatch) -> Result<()> {
        self.publish(batch.to_frame()).await
    }

    /// Returns the ids currently in the registry, in ascending order.
    pub async fn subscribers(&self) -> Result<Vec<SubscriberId>> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Subscribers { respond_to: tx }).await?;
        rx.await.map_err(|_| Error::HubClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::tests::NullTransport;

    fn hub(queue_capacity: usize) -> HubHandle {
        BroadcastHub::spawn(HubConfig {
            queue_capacity,
            ..HubConfig::default()
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = hub(2);
        hub.publish("nobody listening").await.unwrap();
        assert!(hub.subscribers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let hub = hub(8);
        let (sub1, mut out1) = hub.new_subscriber(NullTransport::shared());
        let (sub2, mut out2) = hub.new_subscriber(NullTransport::shared());
        hub.subscribe(sub1).await.unwrap();
        hub.subscribe(sub2).await.unwrap();

        for text in ["one", "two", "three"] {
            hub.publish(text).await.unwrap();
        }

        for out in [&mut out1, &mut out2] {
            for expected in ["one", "two", "three"] {
                assert_eq!(&*out.recv().await.unwrap(), expected);
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscribers_evicted_independently() {
        let hub = hub(2);

        let mut queues = Vec::new();
        let mut transports = Vec::new();
        for _ in 0..3 {
            let transport = NullTransport::shared();
            let (sub, out) = hub.new_subscriber(transport.clone());
            hub.subscribe(sub).await.unwrap();
            queues.push(out);
            transports.push(transport);
        }

        hub.publish("1").await.unwrap();
        hub.publish("2").await.unwrap();
        assert_eq!(hub.subscribers().await.unwrap().len(), 3);

        hub.publish("3").await.unwrap();
        assert!(hub.subscribers().await.unwrap().is_empty());

        for out in &mut queues {
            assert_eq!(&*out.recv().await.unwrap(), "1");
            assert_eq!(&*out.recv().await.unwrap(), "2");
            assert!(out.recv().await.is_none());
        }

        // Transport close happens on a separate task
        for transport in &transports {
            transport.wait_closed().await;
        }
    }

    #[tokio::test]
    async fn test_eviction_leaves_fast_subscriber() {
        let hub = hub(1);
        let (slow, _slow_out) = hub.new_subscriber(NullTransport::shared());
        let (fast, mut fast_out) = hub.new_subscriber(NullTransport::shared());
        let fast_id = fast.id();
        hub.subscribe(slow).await.unwrap();
        hub.subscribe(fast).await.unwrap();

        hub.publish("a").await.unwrap();
        assert_eq!(&*fast_out.recv().await.unwrap(), "a");

        hub.publish("b").await.unwrap();
        assert_eq!(hub.subscribers().await.unwrap(), vec![fast_id]);
        assert_eq!(&*fast_out.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_double_unsubscribe() {
        let hub = hub(4);
        let transport = NullTransport::shared();
        let (sub, mut out) = hub.new_subscriber(transport.clone());
        let id = sub.id();
        hub.subscribe(sub).await.unwrap();

        hub.unsubscribe(id).await.unwrap();
        hub.unsubscribe(id).await.unwrap();

        assert!(hub.subscribers().await.unwrap().is_empty());
        assert!(out.recv().await.is_none());
        // Unsubscribing closes the queue, not the transport
        assert_eq!(transport.close_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_ignored() {
        let hub = hub(4);
        let transport: Arc<dyn Transport> = NullTransport::shared();
        let (sub, _out) = hub.new_subscriber(transport.clone());
        let (queue, _out2) = tokio::sync::mpsc::channel(1);
        let twin = Subscriber::from_parts(sub.id(), queue, transport);

        hub.subscribe(sub).await.unwrap();
        hub.subscribe(twin).await.unwrap();
        assert_eq!(hub.subscribers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_queue_is_pruned() {
        let hub = hub(4);
        let (sub, out) = hub.new_subscriber(NullTransport::shared());
        hub.subscribe(sub).await.unwrap();
        drop(out);

        hub.publish("x").await.unwrap();
        assert!(hub.subscribers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hub_stops_with_last_handle() {
        let (hub, task) = BroadcastHub::spawn_with_task(HubConfig::default());
        let (sub, mut out) = hub.new_subscriber(NullTransport::shared());
        hub.subscribe(sub).await.unwrap();

        drop(hub);
        task.await.unwrap();
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_config_clamped() {
        let hub = hub(0);
        assert_eq!(hub.queue_capacity(), 1);
    }
}
