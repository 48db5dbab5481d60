//! In-process queue with visibility-timeout leases.
//!
//! Behaves like SQS from a consumer's point of view: a received message is
//! hidden from other receivers until it is deleted or its lease runs out,
//! and `release` does nothing. Nothing survives a restart, so this backend
//! is for tests and local runs only.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};

use super::{generate_message_id, MessageQueue, ReceiveOptions, ReceivedMessage};
use crate::error::QueueError;

/// Lease length used when a receive does not ask for one.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    id: String,
    body: Vec<u8>,
    receive_count: u32,
    lease: Option<Lease>,
}

#[derive(Debug)]
struct Lease {
    receipt: String,
    until: Instant,
}

impl Entry {
    fn visible_at(&self, now: Instant) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.until <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<Entry>>,
    arrivals: Notify,
    receive_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet deleted, leased or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages a receive issued now would return.
    pub async fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.visible_at(now))
            .count()
    }

    /// Number of receive calls made so far.
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("queue closed".to_string()));
        }
        Ok(())
    }

    /// Lease up to `max` visible messages, or report when the next lease
    /// expires if none are visible.
    async fn take_visible(
        &self,
        max: usize,
        lease_for: Duration,
    ) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut batch = Vec::new();

        for entry in entries.iter_mut().filter(|entry| entry.visible_at(now)) {
            if batch.len() >= max {
                break;
            }
            entry.receive_count += 1;
            let receipt = format!("{}-{}", entry.id, entry.receive_count);
            entry.lease = Some(Lease {
                receipt: receipt.clone(),
                until: now + lease_for,
            });
            batch.push(ReceivedMessage {
                message_id: entry.id.clone(),
                receipt,
                body: entry.body.clone(),
                receive_count: Some(entry.receive_count),
            });
        }

        let next_expiry = entries
            .iter()
            .filter_map(|entry| entry.lease.as_ref().map(|lease| lease.until))
            .filter(|until| *until > now)
            .min();

        (batch, next_expiry)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, body: Vec<u8>) -> Result<String, QueueError> {
        self.ensure_open()?;
        let id = generate_message_id();
        self.entries.lock().await.push(Entry {
            id: id.clone(),
            body,
            receive_count: 0,
            lease: None,
        });
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let lease_for = options
            .visibility_timeout
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT);
        let max = options.max_messages.max(1);
        let deadline = Instant::now() + options.wait;

        loop {
            self.ensure_open()?;
            let arrival = self.arrivals.notified();
            let (batch, next_expiry) = self.take_visible(max, lease_for).await;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = arrival => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        let position = entries.iter().position(|entry| {
            entry
                .lease
                .as_ref()
                .is_some_and(|lease| lease.receipt == message.receipt)
        });

        match position {
            Some(index) => {
                entries.remove(index);
                Ok(())
            }
            None => Err(QueueError::Delete(format!(
                "unknown receipt {}",
                message.receipt
            ))),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(wait: Duration, visibility: Duration) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: 10,
            wait,
            visibility_timeout: Some(visibility),
        }
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let queue = MemoryQueue::new();
        let id = queue.send(b"hello".to_vec()).await.unwrap();

        let batch = queue
            .receive(options(Duration::ZERO, Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].body, b"hello");
        assert_eq!(batch[0].receive_count, Some(1));
    }

    #[tokio::test]
    async fn test_leased_message_is_hidden() {
        let queue = MemoryQueue::new();
        queue.send(b"one".to_vec()).await.unwrap();

        let first = queue
            .receive(options(Duration::ZERO, Duration::from_secs(30)))
            .await
            .unwrap();
        let second = queue
            .receive(options(Duration::ZERO, Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.visible_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_redelivers() {
        let queue = MemoryQueue::new();
        queue.send(b"one".to_vec()).await.unwrap();

        let first = queue
            .receive(options(Duration::ZERO, Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let second = queue
            .receive(options(Duration::ZERO, Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_ne!(second[0].receipt, first[0].receipt);
        assert_eq!(second[0].receive_count, Some(2));
    }

    #[tokio::test]
    async fn test_delete_acknowledges() {
        let queue = MemoryQueue::new();
        queue.send(b"one".to_vec()).await.unwrap();

        let batch = queue
            .receive(options(Duration::ZERO, Duration::from_secs(30)))
            .await
            .unwrap();
        queue.delete(&batch[0]).await.unwrap();

        assert!(queue.is_empty().await);
        assert!(queue.delete(&batch[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_respects_max() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            queue.send(vec![i]).await.unwrap();
        }

        let batch = queue
            .receive(ReceiveOptions {
                max_messages: 3,
                wait: Duration::ZERO,
                visibility_timeout: None,
            })
            .await
            .unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(queue.visible_len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = std::sync::Arc::new(MemoryQueue::new());

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .receive(options(Duration::from_secs(20), Duration::from_secs(30)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send(b"late".to_vec()).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, b"late");
    }

    #[tokio::test]
    async fn test_closed_queue_refuses_work() {
        let queue = MemoryQueue::new();
        queue.send(b"one".to_vec()).await.unwrap();
        queue.close().await;

        assert!(matches!(
            queue.send(b"two".to_vec()).await,
            Err(QueueError::Connection(_))
        ));
        assert!(matches!(
            queue
                .receive(options(Duration::ZERO, Duration::from_secs(30)))
                .await,
            Err(QueueError::Connection(_))
        ));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let queue = MemoryQueue::new();
        let started = Instant::now();

        let batch = queue
            .receive(options(Duration::from_secs(2), Duration::from_secs(30)))
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(queue.receive_calls(), 1);
    }
}
