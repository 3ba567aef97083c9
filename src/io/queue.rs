//! In-process FIFO queue with visibility timeout and deduplication
//!
//! Semantics follow a FIFO message queue:
//! - Messages are delivered in send order within a message group, and a
//!   group is blocked while one of its messages is in flight
//! - A received message stays invisible until deleted or until the
//!   visibility timeout expires, after which it is redelivered
//! - Sends carrying a dedup id already seen within the dedup window are
//!   accepted but not enqueued
//!
//! The state lock is never held across an await, so `receive` is cancel-safe.

use crate::io::collaborators::{MessageQueue, OutboundMessage, ReceivedMessage, SendReceipt};
use crate::io::memory::FailureBudget;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub dedup_window: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { visibility_timeout: Duration::from_secs(30), dedup_window: Duration::from_secs(300) }
    }
}

#[derive(Debug)]
struct StoredMessage {
    seq: u64,
    message_id: String,
    body: String,
    group_id: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    /// Ordered by `seq`
    ready: VecDeque<StoredMessage>,
    /// Keyed by receipt handle
    in_flight: FxHashMap<String, InFlight>,
    /// dedup id -> (message id, expiry)
    dedup: FxHashMap<String, (String, Instant)>,
}

impl QueueState {
    /// Return timed-out messages to the ready list and forget expired dedup ids
    fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();

        for handle in &expired {
            if let Some(flight) = self.in_flight.remove(handle) {
                let pos = self.ready.partition_point(|m| m.seq < flight.message.seq);
                self.ready.insert(pos, flight.message);
            }
        }

        self.dedup.retain(|_, (_, expires_at)| *expires_at > now);
        expired.len()
    }

    fn take(&mut self, now: Instant, visibility_timeout: Duration) -> Option<ReceivedMessage> {
        let busy_groups: FxHashSet<&str> =
            self.in_flight.values().map(|f| f.message.group_id.as_str()).collect();
        let idx = self.ready.iter().position(|m| !busy_groups.contains(m.group_id.as_str()))?;

        let mut message = self.ready.remove(idx)?;
        message.receive_count += 1;
        let receipt_handle = Uuid::now_v7().to_string();
        let received = ReceivedMessage {
            message_id: message.message_id.clone(),
            receipt_handle: receipt_handle.clone(),
            body: message.body.clone(),
            group_id: message.group_id.clone(),
            receive_count: message.receive_count,
        };
        self.in_flight
            .insert(receipt_handle, InFlight { message, visible_at: now + visibility_timeout });
        Some(received)
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

/// Queue depth snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
}

pub struct MemoryQueue {
    name: String,
    settings: QueueSettings,
    state: Mutex<QueueState>,
    notify: Notify,
    send_failures: FailureBudget,
}

impl MemoryQueue {
    pub fn new(name: &str, settings: QueueSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            send_failures: FailureBudget::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> QueueDepth {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        QueueDepth { ready: state.ready.len(), in_flight: state.in_flight.len() }
    }

    /// Make the next `n` sends fail
    pub fn fail_next_sends(&self, n: u32) {
        self.send_failures.fail_next(n);
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<SendReceipt> {
        self.send_failures.check(&self.name)?;

        let receipt = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.expire(now);

            if let Some((message_id, _)) = state.dedup.get(&message.dedup_id) {
                debug!(queue = %self.name, dedup_id = %message.dedup_id, "queue_duplicate_suppressed");
                return Ok(SendReceipt { message_id: message_id.clone(), duplicate: true });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let message_id = Uuid::now_v7().to_string();
            state.dedup.insert(
                message.dedup_id,
                (message_id.clone(), now + self.settings.dedup_window),
            );
            state.ready.push_back(StoredMessage {
                seq,
                message_id: message_id.clone(),
                body: message.body,
                group_id: message.group_id,
                receive_count: 0,
            });
            SendReceipt { message_id, duplicate: false }
        };

        self.notify.notify_waiters();
        Ok(receipt)
    }

    async fn receive(&self, wait: Duration) -> anyhow::Result<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking state so a concurrent send is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let redelivered = state.expire(now);
                if redelivered > 0 {
                    debug!(queue = %self.name, count = redelivered, "queue_visibility_expired");
                }
                if let Some(message) = state.take(now, self.settings.visibility_timeout) {
                    return Ok(Some(message));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state.next_visible_at().map_or(deadline, |t| t.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            state.expire(Instant::now());
            if state.in_flight.remove(receipt_handle).is_none() {
                bail!("queue {}: receipt handle {} is not in flight", self.name, receipt_handle);
            }
        }
        // Deleting may unblock the message group
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings() -> QueueSettings {
        QueueSettings {
            visibility_timeout: Duration::from_secs(30),
            dedup_window: Duration::from_secs(300),
        }
    }

    fn msg(body: &str, group: &str) -> OutboundMessage {
        OutboundMessage {
            body: body.to_string(),
            group_id: group.to_string(),
            dedup_id: body.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_group() {
        let queue = MemoryQueue::new("a", settings());
        queue.send(msg("first", "g")).await.unwrap();
        queue.send(msg("second", "g")).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body, "first");
        assert_eq!(first.receive_count, 1);

        // Group blocked while "first" is in flight
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());

        queue.delete(&first.receipt_handle).await.unwrap();
        let second = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.body, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_independent() {
        let queue = MemoryQueue::new("a", settings());
        queue.send(msg("a1", "g1")).await.unwrap();
        queue.send(msg("a2", "g1")).await.unwrap();
        queue.send(msg("b1", "g2")).await.unwrap();

        let a1 = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        let b1 = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a1.body, "a1");
        assert_eq!(b1.body, "b1");
        assert_eq!(queue.depth(), QueueDepth { ready: 1, in_flight: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_visibility_timeout() {
        let queue = MemoryQueue::new("a", settings());
        queue.send(msg("only", "g")).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let second = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.receive_count, 2);
        assert_ne!(second.receipt_handle, first.receipt_handle);

        // Stale receipt can no longer acknowledge
        assert!(queue.delete(&first.receipt_handle).await.is_err());
        queue.delete(&second.receipt_handle).await.unwrap();
        assert_eq!(queue.depth(), QueueDepth { ready: 0, in_flight: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_message_keeps_its_place() {
        let queue = MemoryQueue::new("a", settings());
        queue.send(msg("first", "g1")).await.unwrap();
        queue.send(msg("other", "g2")).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body, "first");
        tokio::time::advance(Duration::from_secs(31)).await;

        let again = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.body, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window() {
        let queue = MemoryQueue::new("a", settings());
        let original = queue.send(msg("x", "g")).await.unwrap();
        let dup = queue.send(msg("x", "g")).await.unwrap();
        assert!(!original.duplicate);
        assert!(dup.duplicate);
        assert_eq!(dup.message_id, original.message_id);
        assert_eq!(queue.depth().ready, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let later = queue.send(msg("x", "g")).await.unwrap();
        assert!(!later.duplicate);
        assert_eq!(queue.depth().ready, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_survives_delete() {
        let queue = MemoryQueue::new("a", settings());
        queue.send(msg("x", "g")).await.unwrap();
        let received = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue.delete(&received.receipt_handle).await.unwrap();

        assert!(queue.send(msg("x", "g")).await.unwrap().duplicate);
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = Arc::new(MemoryQueue::new("a", settings()));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Duration::from_secs(20)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send(msg("late", "g")).await.unwrap();

        let received = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(received.body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let queue = MemoryQueue::new("a", settings());
        let start = Instant::now();
        assert!(queue.receive(Duration::from_secs(20)).await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_send_failure() {
        let queue = MemoryQueue::new("a", settings());
        queue.fail_next_sends(1);
        assert!(queue.send(msg("x", "g")).await.is_err());
        assert!(!queue.send(msg("x", "g")).await.unwrap().duplicate);
    }
}
