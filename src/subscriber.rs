//! Per-viewer state and the lifecycle of a viewer connection.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::error::Result;
use crate::hub::HubHandle;

/// A single text frame as delivered to viewers.
pub type Frame = Arc<str>;

/// Identifies a subscriber for the lifetime of its hub.
#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// A bidirectional, text-framed channel to one viewer.
///
/// `send` and `receive` may be called concurrently from different tasks.
/// `close` must be idempotent: the hub may close a transport on eviction
/// while the connection is tearing itself down. It must also make any pending
/// `send` or `receive` return, even one stuck on a peer that stopped reading.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<()>>;

    /// Returns the next inbound text, or `None` once the peer has gone away.
    fn receive(&self) -> BoxFuture<'_, Result<Option<String>>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A registered viewer, as held by the hub's registry.
pub struct Subscriber {
    id: SubscriberId,
    queue: mpsc::Sender<Frame>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub(crate) fn new(
        id: SubscriberId,
        capacity: usize,
        transport: Arc<dyn Transport>,
    ) -> (Self, Outbound) {
        let (queue, receiver) = mpsc::channel(capacity);

        (
            Self::from_parts(id, queue, transport),
            Outbound { id, receiver },
        )
    }

    pub(crate) fn from_parts(
        id: SubscriberId,
        queue: mpsc::Sender<Frame>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Subscriber {
            id,
            queue,
            transport,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn try_enqueue(
        &self,
        frame: Frame,
    ) -> std::result::Result<(), TrySendError<Frame>> {
        self.queue.try_send(frame)
    }

    /// Closes the transport on a separate task, so the hub never waits on it.
    pub(crate) fn close_transport(&self) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.close().await;
        });
    }
}

/// Receiving end of a subscriber's bounded queue, consumed by its drain loop.
#[derive(Debug)]
pub struct Outbound {
    id: SubscriberId,
    receiver: mpsc::Receiver<Frame>,
}

impl Outbound {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns the next queued frame, or `None` once the hub has let go of
    /// the subscriber and the queue is empty.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }
}

/// Writes queued frames to `transport` in order until the queue closes or a
/// write fails, then closes the transport.
pub async fn drain_loop(mut outbound: Outbound, transport: &dyn Transport) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = transport.send(frame).await {
            debug!(subscriber = %outbound.id, "write failed: {}", e);
            break;
        }
    }

    transport.close().await;
}

/// Reads from `transport` until the peer goes away or a read fails.
///
/// Viewers are read-only; inbound text is discarded.
pub async fn read_loop(id: SubscriberId, transport: &dyn Transport) {
    loop {
        match transport.receive().await {
            Ok(Some(text)) => {
                trace!(subscriber = %id, len = text.len(), "ignoring inbound text");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(subscriber = %id, "read failed: {}", e);
                break;
            }
        }
    }
}

/// Runs one viewer connection to completion.
///
/// Registers a subscriber for `transport`, writes `preamble` ahead of any live
/// frames, then runs the drain and read loops together. Whichever ends first
/// ends the other; the subscriber is then unregistered and the transport
/// closed.
pub async fn serve(
    hub: &HubHandle,
    transport: Arc<dyn Transport>,
    preamble: Vec<Frame>,
) -> Result<SubscriberId> {
    let (subscriber, outbound) = hub.new_subscriber(transport.clone());
    let id = subscriber.id();

    if let Err(e) = hub.subscribe(subscriber).await {
        transport.close().await;
        return Err(e);
    }
    debug!(subscriber = %id, "connected");

    let writer = {
        let transport = transport.clone();
        async move {
            for frame in preamble {
                if let Err(e) = transport.send(frame).await {
                    debug!(subscriber = %id, "preamble write failed: {}", e);
                    return;
                }
            }
            drain_loop(outbound, transport.as_ref()).await
        }
    };

    tokio::select! {
        _ = writer => debug!(subscriber = %id, "drain loop ended"),
        _ = read_loop(id, transport.as_ref()) => debug!(subscriber = %id, "read loop ended"),
    }

    // The hub may already be gone, in which case there is nothing to leave.
    let _ = hub.unsubscribe(id).await;
    transport.close().await;

    debug!(subscriber = %id, "disconnected");

    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hub::{BroadcastHub, HubConfig};
    use futures_util::future::{self, FutureExt};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};
    use tokio::time::timeout;

    /// Accepts everything, never receives.
    #[derive(Default)]
    pub(crate) struct NullTransport {
        closes: AtomicUsize,
        closed: Notify,
    }

    impl NullTransport {
        pub(crate) fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub(crate) async fn wait_closed(&self) {
            if self.close_count() == 0 {
                self.closed.notified().await;
            }
        }
    }

    impl Transport for NullTransport {
        fn send(&self, _frame: Frame) -> BoxFuture<'_, Result<()>> {
            future::ready(Ok(())).boxed()
        }

        fn receive(&self) -> BoxFuture<'_, Result<Option<String>>> {
            future::pending().boxed()
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.notify_one();
            future::ready(()).boxed()
        }
    }

    /// In-memory viewer: frames written to it come out of `sent`, and text
    /// pushed into `typed` comes out of `receive`.
    struct ChannelTransport {
        sent: mpsc::UnboundedSender<String>,
        typed: Mutex<mpsc::UnboundedReceiver<String>>,
        fail_sends: AtomicBool,
        closes: AtomicUsize,
    }

    impl ChannelTransport {
        fn pair() -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<String>,
            mpsc::UnboundedSender<String>,
        ) {
            let (sent, sent_rx) = mpsc::unbounded_channel();
            let (typed_tx, typed) = mpsc::unbounded_channel();
            let transport = Arc::new(ChannelTransport {
                sent,
                typed: Mutex::new(typed),
                fail_sends: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
            });
            (transport, sent_rx, typed_tx)
        }
    }

    impl Transport for ChannelTransport {
        fn send(&self, frame: Frame) -> BoxFuture<'_, Result<()>> {
            let res = if self.fail_sends.load(Ordering::SeqCst) {
                Err(Error::Transport("broken pipe".into()))
            } else {
                self.sent
                    .send(frame.to_string())
                    .map_err(|_| Error::Transport("viewer gone".into()))
            };
            future::ready(res).boxed()
        }

        fn receive(&self) -> BoxFuture<'_, Result<Option<String>>> {
            async move { Ok(self.typed.lock().await.recv().await) }.boxed()
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            future::ready(()).boxed()
        }
    }

    async fn wait_for_subscribers(hub: &HubHandle, n: usize) {
        while hub.subscribers().await.unwrap().len() != n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_preamble_then_live_frames() {
        let hub = BroadcastHub::spawn(HubConfig::default());
        let (transport, mut sent, _typed) = ChannelTransport::pair();

        let session = tokio::spawn({
            let hub = hub.clone();
            let transport = transport.clone();
            async move { serve(&hub, transport, vec![Frame::from("snapshot")]).await }
        });

        wait_for_subscribers(&hub, 1).await;
        hub.publish("live").await.unwrap();

        assert_eq!(sent.recv().await.unwrap(), "snapshot");
        assert_eq!(sent.recv().await.unwrap(), "live");

        session.abort();
    }

    #[tokio::test]
    async fn test_viewer_disconnect_unsubscribes() {
        let hub = BroadcastHub::spawn(HubConfig::default());
        let (transport, _sent, typed) = ChannelTransport::pair();

        let session = tokio::spawn({
            let hub = hub.clone();
            let transport = transport.clone();
            async move { serve(&hub, transport, Vec::new()).await }
        });

        wait_for_subscribers(&hub, 1).await;
        typed.send("hello?".into()).unwrap();
        drop(typed);

        let id = timeout(Duration::from_secs(2), session)
            .await
            .expect("session did not end")
            .unwrap()
            .unwrap();
        assert!(!hub.subscribers().await.unwrap().contains(&id));
        assert!(transport.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_write_failure_ends_session() {
        let hub = BroadcastHub::spawn(HubConfig::default());
        let (transport, _sent, _typed) = ChannelTransport::pair();

        let session = tokio::spawn({
            let hub = hub.clone();
            let transport = transport.clone();
            async move { serve(&hub, transport, Vec::new()).await }
        });

        wait_for_subscribers(&hub, 1).await;
        transport.fail_sends.store(true, Ordering::SeqCst);
        hub.publish("doomed").await.unwrap();

        timeout(Duration::from_secs(2), session)
            .await
            .expect("session did not end")
            .unwrap()
            .unwrap();
        assert!(hub.subscribers().await.unwrap().is_empty());
        assert!(transport.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_eviction_ends_session() {
        let hub = BroadcastHub::spawn(HubConfig {
            queue_capacity: 1,
            ..HubConfig::default()
        });
        let (transport, _sent, _typed) = ChannelTransport::pair();
        let (subscriber, outbound) = hub.new_subscriber(transport.clone());
        hub.subscribe(subscriber).await.unwrap();

        hub.publish("one").await.unwrap();
        hub.publish("two").await.unwrap();
        assert!(hub.subscribers().await.unwrap().is_empty());

        // The queued frame still drains, then the loop stops on its own.
        timeout(Duration::from_secs(2), drain_loop(outbound, transport.as_ref()))
            .await
            .expect("drain loop did not end");
    }

    #[tokio::test]
    async fn test_serve_after_hub_shutdown() {
        let (hub, task) = BroadcastHub::spawn_with_task(HubConfig::default());
        let stale = hub.clone();
        drop(hub);
        // `stale` keeps the channel open, so close it by aborting the loop.
        task.abort();
        let _ = task.await;

        let (transport, _sent, _typed) = ChannelTransport::pair();
        let res = serve(&stale, transport.clone(), Vec::new()).await;
        assert!(matches!(res, Err(Error::HubClosed)));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriber_id_display() {
        assert_eq!(SubscriberId(7).to_string(), "subscriber-7");
    }
}
