//! Publish/subscribe boundary between gateway processes.
//!
//! Two delivery modes are offered:
//! - channels: fire-and-forget fan-out with latest-state-wins semantics. A
//!   subscriber that falls behind skips what it missed instead of blocking the
//!   publisher. A channel can also retain its last payload for late joiners.
//! - queues: lossless FIFO with a single consumer, for world mutations that
//!   must be applied exactly once.

use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

pub type BusPayload = Arc<[u8]>;

pub trait MessageBus: Send + Sync {
    /// Publishes to every current subscriber of `channel` and returns how many
    /// there were. Never waits for them.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> usize;

    /// Like [`MessageBus::publish`], and also keeps the payload as the
    /// channel's retained value.
    fn publish_retained(&self, channel: &str, payload: Vec<u8>) -> usize;

    /// Last payload passed to [`MessageBus::publish_retained`] on `channel`.
    fn retained(&self, channel: &str) -> Option<BusPayload>;

    fn subscribe(&self, channel: &str) -> Subscription;

    /// Appends to `queue` without waiting. Nothing is dropped while the queue
    /// has or may still get a consumer; returns false once its consumer is gone.
    fn enqueue(&self, queue: &str, payload: Vec<u8>) -> bool;

    /// Takes the receiving end of `queue`, including anything enqueued before.
    /// A queue has at most one consumer; later calls return `None`.
    fn consume(&self, queue: &str) -> Option<QueueConsumer>;

    /// True once some task has called [`MessageBus::consume`] on `queue`.
    fn has_consumer(&self, queue: &str) -> bool;
}

/// Receiving end of a bus channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<BusPayload>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: broadcast::Receiver<BusPayload>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message, skipping over anything lost to lag.
    /// Returns `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<BusPayload> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber on {} lagged, skipped {} messages",
                        self.channel, skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Sole receiving end of a bus queue.
#[derive(Debug)]
pub struct QueueConsumer {
    queue: String,
    receiver: mpsc::UnboundedReceiver<BusPayload>,
}

impl QueueConsumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next payload, in enqueue order.
    pub async fn recv(&mut self) -> Option<BusPayload> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
struct Queue {
    sender: mpsc::UnboundedSender<BusPayload>,
    receiver: Option<mpsc::UnboundedReceiver<BusPayload>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

#[derive(Default)]
struct Tables {
    channels: HashMap<String, broadcast::Sender<BusPayload>>,
    retained: HashMap<String, BusPayload>,
    queues: HashMap<String, Queue>,
}

/// In-process bus shared by every gateway running in the same process.
pub struct LocalBus {
    tables: Mutex<Tables>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// `capacity` bounds how far a channel subscriber may lag. Queues are
    /// unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BusPayload> {
        let mut tables = self.tables.lock();
        tables
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> usize {
        self.sender(channel).send(payload.into()).unwrap_or(0)
    }

    fn publish_retained(&self, channel: &str, payload: Vec<u8>) -> usize {
        let payload: BusPayload = payload.into();
        self.tables
            .lock()
            .retained
            .insert(channel.to_string(), Arc::clone(&payload));
        self.sender(channel).send(payload).unwrap_or(0)
    }

    fn retained(&self, channel: &str) -> Option<BusPayload> {
        self.tables.lock().retained.get(channel).cloned()
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        Subscription::new(channel, self.sender(channel).subscribe())
    }

    fn enqueue(&self, queue: &str, payload: Vec<u8>) -> bool {
        let mut tables = self.tables.lock();
        let entry = tables
            .queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new);
        entry.sender.send(payload.into()).is_ok()
    }

    fn consume(&self, queue: &str) -> Option<QueueConsumer> {
        let mut tables = self.tables.lock();
        let entry = tables
            .queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new);
        entry.receiver.take().map(|receiver| QueueConsumer {
            queue: queue.to_string(),
            receiver,
        })
    }

    fn has_consumer(&self, queue: &str) -> bool {
        self.tables
            .lock()
            .queues
            .get(queue)
            .map(|entry| entry.receiver.is_none())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("game1");
        let mut second = bus.subscribe("game1");

        assert_eq!(bus.publish("game1", b"hello".to_vec()), 2);

        assert_eq!(&*first.recv().await.unwrap(), b"hello");
        assert_eq!(&*second.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = LocalBus::new();
        let mut game1 = bus.subscribe("game1");
        let _game2 = bus.subscribe("game2");

        bus.publish("game2", b"other".to_vec());
        bus.publish("game1", b"mine".to_vec());

        assert_eq!(game1.channel(), "game1");
        assert_eq!(&*game1.recv().await.unwrap(), b"mine");
    }

    #[test]
    fn test_recv_waits_for_publish() {
        let bus = LocalBus::new();
        let mut subscription = bus.subscribe("game1");
        let mut recv = tokio_test::task::spawn(subscription.recv());

        tokio_test::assert_pending!(recv.poll());
        bus.publish("game1", vec![1]);
        assert!(recv.is_woken());

        let payload = tokio_test::assert_ready!(recv.poll());
        assert_eq!(&*payload.unwrap(), &[1]);
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        assert_eq!(bus.publish("nobody", b"lost".to_vec()), 0);
    }

    /// A lagging channel subscriber skips to the newest payloads
    #[tokio::test]
    async fn test_lagging_subscriber_gets_latest() {
        let bus = LocalBus::with_capacity(2);
        let mut slow = bus.subscribe("game1");

        for i in 0..5u8 {
            bus.publish("game1", vec![i]);
        }

        assert_eq!(&*slow.recv().await.unwrap(), &[3]);
        assert_eq!(&*slow.recv().await.unwrap(), &[4]);
    }

    /// A queue keeps every payload in order even when far more arrive than a
    /// channel could hold
    #[tokio::test]
    async fn test_queue_is_lossless_under_burst() {
        let bus = LocalBus::with_capacity(2);
        let mut consumer = bus.consume("game1.commands").unwrap();

        for i in 0..200u8 {
            assert!(bus.enqueue("game1.commands", vec![i]));
        }

        for i in 0..200u8 {
            assert_eq!(&*consumer.recv().await.unwrap(), &[i]);
        }
        assert_eq!(consumer.queue(), "game1.commands");
    }

    /// Payloads enqueued before the consumer attaches are kept for it
    #[tokio::test]
    async fn test_queue_buffers_until_consumed() {
        let bus = LocalBus::new();
        assert!(!bus.has_consumer("game1.commands"));
        assert!(bus.enqueue("game1.commands", b"early".to_vec()));

        let mut consumer = bus.consume("game1.commands").unwrap();
        assert!(bus.has_consumer("game1.commands"));
        assert!(bus.consume("game1.commands").is_none());
        assert_eq!(&*consumer.recv().await.unwrap(), b"early");
    }

    /// Enqueue reports failure once the consumer is dropped
    #[test]
    fn test_enqueue_after_consumer_dropped() {
        let bus = LocalBus::new();
        drop(bus.consume("game1.commands"));
        assert!(!bus.enqueue("game1.commands", b"late".to_vec()));
    }

    /// Late joiners can read the retained payload of a channel
    #[test]
    fn test_retained_payload_survives_without_subscribers() {
        let bus = LocalBus::new();
        assert!(bus.retained("game1.problems").is_none());

        assert_eq!(bus.publish_retained("game1.problems", b"first".to_vec()), 0);
        bus.publish_retained("game1.problems", b"second".to_vec());
        bus.publish("game1.problems", b"not kept".to_vec());

        assert_eq!(&*bus.retained("game1.problems").unwrap(), b"second");
        assert!(bus.retained("game1").is_none());
    }
}
