use log::{debug, warn};
use serde::Serialize;

use crate::error::TransportError;

pub const QUEUE_CAPACITY: usize = 20;
pub const MAX_TOPIC_LEN: usize = 64;
pub const MAX_PAYLOAD_LEN: usize = 1_024;
pub const MESSAGE_EXPIRY_MS: u64 = 300_000;
pub const MAX_DRAIN_PER_TICK: usize = 5;

/// The wire connection to the broker. Implemented by the platform MQTT client.
pub trait Transport {
    fn is_connected(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError>;
}

/// Where status producers hand their messages: publish now if possible, otherwise queue.
pub trait StatusSink {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Delivery;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Published,
    Queued,
    Dropped,
}

impl Delivery {
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub enqueued_at_ms: u64,
}

impl QueuedMessage {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.enqueued_at_ms) > MESSAGE_EXPIRY_MS
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u32,
    pub evicted: u32,
    pub expired: u32,
    pub published: u32,
    pub rejected: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    pub expired: usize,
    pub aborted: bool,
}

/// Fixed-capacity drop-oldest ring of messages waiting for the transport.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    slots: Vec<Option<QueuedMessage>>,
    head: usize,
    count: usize,
    stats: QueueStats,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            head: 0,
            count: 0,
            stats: QueueStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        (0..self.count).filter_map(move |offset| {
            self.slots[(self.head + offset) % self.slots.len()].as_ref()
        })
    }

    /// Admits the message, evicting the oldest entry when full. Only oversized messages are refused.
    pub fn enqueue(&mut self, topic: &str, payload: &[u8], retain: bool, now_ms: u64) -> bool {
        if topic.is_empty() || topic.len() > MAX_TOPIC_LEN || payload.len() > MAX_PAYLOAD_LEN {
            warn!(
                "rejecting message for `{topic}` ({} byte topic, {} byte payload)",
                topic.len(),
                payload.len()
            );
            self.stats.rejected = self.stats.rejected.saturating_add(1);
            return false;
        }

        if self.count == self.capacity() {
            if let Some(evicted) = self.pop_front() {
                debug!("queue full, dropping oldest message for {}", evicted.topic);
            }
            self.stats.evicted = self.stats.evicted.saturating_add(1);
        }

        let tail = (self.head + self.count) % self.capacity();
        self.slots[tail] = Some(QueuedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
            enqueued_at_ms: now_ms,
        });
        self.count += 1;
        self.stats.enqueued = self.stats.enqueued.saturating_add(1);
        debug!("queued {topic} ({}/{})", self.count, self.capacity());
        true
    }

    /// Publishes directly when connected and nothing is waiting, otherwise queues behind the backlog.
    pub fn publish_or_enqueue<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
        retain: bool,
        now_ms: u64,
    ) -> Delivery {
        if transport.is_connected() && self.is_empty() {
            match transport.publish(topic, payload, retain) {
                Ok(()) => {
                    self.stats.published = self.stats.published.saturating_add(1);
                    return Delivery::Published;
                }
                Err(err) => debug!("direct publish to {topic} failed, queueing: {err}"),
            }
        }

        if self.enqueue(topic, payload, retain, now_ms) {
            Delivery::Queued
        } else {
            Delivery::Dropped
        }
    }

    /// Removes up to `max` entries from the front, publishing the live ones and discarding expired
    /// ones. A failed publish stops the drain and leaves that entry at the front.
    pub fn drain<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        max: usize,
        now_ms: u64,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        let mut processed = 0;

        while processed < max && transport.is_connected() {
            let Some(message) = self.front() else {
                break;
            };

            if message.is_expired(now_ms) {
                debug!("dropping expired message for {}", message.topic);
                self.pop_front();
                self.stats.expired = self.stats.expired.saturating_add(1);
                report.expired += 1;
                processed += 1;
                continue;
            }

            if let Err(err) = transport.publish(&message.topic, &message.payload, message.retain) {
                warn!("publish of queued {} failed: {err}", message.topic);
                report.aborted = true;
                break;
            }

            self.pop_front();
            self.stats.published = self.stats.published.saturating_add(1);
            report.published += 1;
            processed += 1;
        }

        if report.published > 0 || report.expired > 0 {
            debug!(
                "drained {} queued messages ({} expired, {} left)",
                report.published, report.expired, self.count
            );
        }
        report
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.count = 0;
    }

    fn front(&self) -> Option<&QueuedMessage> {
        if self.count == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    fn pop_front(&mut self) -> Option<QueuedMessage> {
        if self.count == 0 {
            return None;
        }
        let message = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        message
    }
}

pub fn publish_json<S, T>(sink: &mut S, topic: &str, value: &T, retain: bool) -> Delivery
where
    S: StatusSink + ?Sized,
    T: Serialize + ?Sized,
{
    match serde_json::to_vec(value) {
        Ok(payload) => sink.publish(topic, &payload, retain),
        Err(err) => {
            warn!("failed to encode payload for {topic}: {err}");
            Delivery::Dropped
        }
    }
}

/// Binds a queue to a transport for the duration of one tick.
pub struct Outbox<'a, T: ?Sized> {
    pub queue: &'a mut OutboundQueue,
    pub transport: &'a mut T,
    pub now_ms: u64,
}

impl<'a, T: Transport + ?Sized> Outbox<'a, T> {
    pub fn new(queue: &'a mut OutboundQueue, transport: &'a mut T, now_ms: u64) -> Self {
        Self {
            queue,
            transport,
            now_ms,
        }
    }
}

impl<T: Transport + ?Sized> StatusSink for Outbox<'_, T> {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Delivery {
        self.queue
            .publish_or_enqueue(&mut *self.transport, topic, payload, retain, self.now_ms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::ScriptedTransport;

    fn topics(queue: &OutboundQueue) -> Vec<String> {
        queue.iter().map(|message| message.topic.clone()).collect()
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut queue = OutboundQueue::new(3);
        for index in 0..4 {
            assert!(queue.enqueue(&format!("t/{index}"), b"x", false, 0));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(topics(&queue), vec!["t/1", "t/2", "t/3"]);
        assert_eq!(queue.stats().evicted, 1);
    }

    #[test]
    fn stats_counters_saturate() {
        let mut queue = OutboundQueue::new(1);
        queue.stats = QueueStats {
            enqueued: u32::MAX,
            evicted: u32::MAX,
            expired: 0,
            published: u32::MAX,
            rejected: u32::MAX,
        };
        let mut transport = ScriptedTransport::connected();

        assert!(queue.enqueue("a", b"1", false, 0));
        assert!(queue.enqueue("b", b"2", false, 0));
        assert!(!queue.enqueue("", b"3", false, 0));
        assert_eq!(queue.drain(&mut transport, 5, 0).published, 1);

        assert_eq!(
            queue.stats(),
            QueueStats {
                enqueued: u32::MAX,
                evicted: u32::MAX,
                expired: 0,
                published: u32::MAX,
                rejected: u32::MAX,
            }
        );
        assert_eq!(transport.topics(), vec!["b"]);
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let mut queue = OutboundQueue::default();
        let long_topic = "t".repeat(MAX_TOPIC_LEN + 1);

        assert!(!queue.enqueue(&long_topic, b"x", false, 0));
        assert!(!queue.enqueue("t", &vec![0; MAX_PAYLOAD_LEN + 1], false, 0));
        assert!(!queue.enqueue("", b"x", false, 0));
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected, 3);
    }

    #[test]
    fn publishes_directly_when_connected() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::connected();

        let delivery = queue.publish_or_enqueue(&mut transport, "a", b"1", true, 0);

        assert_eq!(delivery, Delivery::Published);
        assert!(queue.is_empty());
        assert_eq!(transport.topics(), vec!["a"]);
        assert!(transport.sent[0].retain);
    }

    #[test]
    fn queues_when_disconnected_or_publish_fails() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::disconnected();
        assert_eq!(
            queue.publish_or_enqueue(&mut transport, "a", b"1", false, 0),
            Delivery::Queued
        );

        transport.connected = true;
        transport.fail_next = 1;
        assert_eq!(
            queue.publish_or_enqueue(&mut transport, "b", b"2", false, 0),
            Delivery::Queued
        );
        assert_eq!(topics(&queue), vec!["a", "b"]);
    }

    #[test]
    fn direct_publish_waits_behind_backlog() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::disconnected();
        queue.publish_or_enqueue(&mut transport, "old", b"1", false, 0);

        transport.connected = true;
        let delivery = queue.publish_or_enqueue(&mut transport, "new", b"2", false, 10);
        assert_eq!(delivery, Delivery::Queued);

        queue.drain(&mut transport, MAX_DRAIN_PER_TICK, 20);
        assert_eq!(transport.topics(), vec!["old", "new"]);
    }

    #[test]
    fn drain_never_publishes_expired_messages() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::connected();
        queue.enqueue("stale", b"1", false, 0);
        queue.enqueue("fresh", b"2", false, 200_000);

        let report = queue.drain(&mut transport, MAX_DRAIN_PER_TICK, MESSAGE_EXPIRY_MS + 1);

        assert_eq!(report.expired, 1);
        assert_eq!(report.published, 1);
        assert_eq!(transport.topics(), vec!["fresh"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn message_at_exact_expiry_is_still_sent() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::connected();
        queue.enqueue("edge", b"1", false, 0);

        queue.drain(&mut transport, 1, MESSAGE_EXPIRY_MS);

        assert_eq!(transport.topics(), vec!["edge"]);
    }

    #[test]
    fn failed_publish_aborts_and_keeps_remaining_entries() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::connected();
        for topic in ["a", "b", "c"] {
            queue.enqueue(topic, b"x", false, 0);
        }
        transport.fail_after(1);

        let report = queue.drain(&mut transport, MAX_DRAIN_PER_TICK, 0);

        assert!(report.aborted);
        assert_eq!(report.published, 1);
        assert_eq!(topics(&queue), vec!["b", "c"]);
    }

    #[test]
    fn drain_is_bounded_per_call_and_requires_connection() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::disconnected();
        for index in 0..8 {
            queue.enqueue(&format!("t/{index}"), b"x", false, 0);
        }

        assert_eq!(queue.drain(&mut transport, MAX_DRAIN_PER_TICK, 0), DrainReport::default());

        transport.connected = true;
        let report = queue.drain(&mut transport, MAX_DRAIN_PER_TICK, 0);
        assert_eq!(report.published, MAX_DRAIN_PER_TICK);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn overflowing_queue_keeps_newest_in_order() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::disconnected();
        for index in 0..25 {
            queue.publish_or_enqueue(&mut transport, &format!("topic/{index}"), b"x", false, index);
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);

        transport.connected = true;
        while !queue.is_empty() {
            queue.drain(&mut transport, MAX_DRAIN_PER_TICK, 100);
        }

        let expected: Vec<String> = (5..25).map(|index| format!("topic/{index}")).collect();
        assert_eq!(transport.topics(), expected);
    }

    #[test]
    fn clear_drops_everything() {
        let mut queue = OutboundQueue::new(4);
        queue.enqueue("a", b"x", false, 0);
        queue.enqueue("b", b"x", false, 0);

        queue.clear();

        assert!(queue.is_empty());
        assert!(queue.enqueue("c", b"x", false, 0));
        assert_eq!(topics(&queue), vec!["c"]);
    }

    #[test]
    fn outbox_routes_through_queue() {
        let mut queue = OutboundQueue::default();
        let mut transport = ScriptedTransport::disconnected();

        let delivery = Outbox::new(&mut queue, &mut transport, 5).publish("status", b"{}", true);

        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(queue.iter().next().map(|message| message.enqueued_at_ms), Some(5));
    }
}
