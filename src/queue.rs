//! Priority queue with lease-based at-least-once delivery (§4.4).
//!
//! Backing structure is an in-process `BTreeMap` keyed by
//! `priority*2^41 + enqueue_time_ms`, behind a `Queue` trait so a
//! Redis-backed sorted-set implementation can be substituted later without
//! touching callers (see DESIGN.md).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("dequeue timed out")]
    Timeout,
    #[error("unknown lease for entry {0}")]
    UnknownLease(Uuid),
}

pub type Result<T> = std::result::Result<T, QueueError>;

const PRIORITY_SHIFT: i64 = 41;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub priority: i32,
    pub enqueued_at_ms: i64,
    pub attempt: u32,
}

impl QueueEntry {
    fn score(&self) -> i64 {
        ((self.priority as i64) << PRIORITY_SHIFT) + self.enqueued_at_ms
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, task_id: Uuid, priority: i32) -> Result<()>;
    async fn dequeue(&self, block_timeout: Duration) -> Result<Option<QueueEntry>>;
    async fn ack(&self, entry: &QueueEntry) -> Result<()>;
    async fn nack(&self, entry: &QueueEntry, reason: &str) -> Result<bool>;
    async fn size(&self) -> usize;
    async fn dead_letter_size(&self) -> usize;
}

struct Lease {
    entry: QueueEntry,
    expires_at_ms: i64,
}

pub struct InProcessQueue {
    bands: Mutex<BTreeMap<i64, VecDeque<QueueEntry>>>,
    leases: Mutex<HashMap<Uuid, Lease>>,
    dead_letter: Mutex<HashSet<Uuid>>,
    notify: Notify,
    lease_ms: i64,
    max_attempts: u32,
}

impl InProcessQueue {
    pub fn new(lease: Duration, max_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            bands: Mutex::new(BTreeMap::new()),
            leases: Mutex::new(HashMap::new()),
            dead_letter: Mutex::new(HashSet::new()),
            notify: Notify::new(),
            lease_ms: lease.as_millis() as i64,
            max_attempts,
        })
    }

    /// Move any lease past its deadline back to the head of its priority
    /// band, per the reservation-perturbs-FIFO rule in §4.4.
    async fn reclaim_expired_leases(&self) {
        let now = Utc::now().timestamp_millis();
        let mut expired = Vec::new();
        {
            let mut leases = self.leases.lock().await;
            leases.retain(|_, lease| {
                if lease.expires_at_ms <= now {
                    expired.push(lease.entry.clone());
                    false
                } else {
                    true
                }
            });
        }
        if expired.is_empty() {
            return;
        }
        let mut bands = self.bands.lock().await;
        for mut entry in expired {
            entry.attempt += 1;
            bands
                .entry(entry.score())
                .or_default()
                .push_front(entry);
        }
        drop(bands);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Queue for InProcessQueue {
    async fn enqueue(&self, task_id: Uuid, priority: i32) -> Result<()> {
        let entry = QueueEntry {
            task_id,
            priority,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            attempt: 0,
        };
        let mut bands = self.bands.lock().await;
        bands.entry(entry.score()).or_default().push_back(entry);
        drop(bands);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, block_timeout: Duration) -> Result<Option<QueueEntry>> {
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            self.reclaim_expired_leases().await;

            {
                let mut bands = self.bands.lock().await;
                if let Some((&score, queue)) = bands.iter_mut().next() {
                    if let Some(entry) = queue.pop_front() {
                        if queue.is_empty() {
                            bands.remove(&score);
                        }
                        let mut leases = self.leases.lock().await;
                        leases.insert(
                            entry.task_id,
                            Lease {
                                entry: entry.clone(),
                                expires_at_ms: Utc::now().timestamp_millis() + self.lease_ms,
                            },
                        );
                        return Ok(Some(entry));
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn ack(&self, entry: &QueueEntry) -> Result<()> {
        let mut leases = self.leases.lock().await;
        leases
            .remove(&entry.task_id)
            .ok_or(QueueError::UnknownLease(entry.task_id))?;
        Ok(())
    }

    async fn nack(&self, entry: &QueueEntry, reason: &str) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        leases
            .remove(&entry.task_id)
            .ok_or(QueueError::UnknownLease(entry.task_id))?;
        drop(leases);

        if entry.attempt + 1 >= self.max_attempts {
            tracing::warn!(task_id = %entry.task_id, reason, "max attempts reached, dead-lettering");
            self.dead_letter.lock().await.insert(entry.task_id);
            return Ok(false);
        }

        let mut requeued = entry.clone();
        requeued.attempt += 1;
        let mut bands = self.bands.lock().await;
        bands.entry(requeued.score()).or_default().push_back(requeued);
        drop(bands);
        self.notify.notify_one();
        Ok(true)
    }

    async fn size(&self) -> usize {
        self.bands.lock().await.values().map(VecDeque::len).sum()
    }

    async fn dead_letter_size(&self) -> usize {
        self.dead_letter.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let queue = InProcessQueue::new(Duration::from_secs(900), 3);
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let t3 = Uuid::new_v4();

        queue.enqueue(t1, 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        queue.enqueue(t2, 5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        queue.enqueue(t3, 5).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        let third = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();

        assert_eq!(first.task_id, t2);
        assert_eq!(second.task_id, t3);
        assert_eq!(third.task_id, t1);
    }

    #[tokio::test]
    async fn nack_requeues_until_max_attempts() {
        let queue = InProcessQueue::new(Duration::from_secs(900), 2);
        let t1 = Uuid::new_v4();
        queue.enqueue(t1, 1).await.unwrap();

        let entry = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        let requeued = queue.nack(&entry, "worker crashed").await.unwrap();
        assert!(requeued);

        let entry2 = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(entry2.attempt, 1);
        let requeued2 = queue.nack(&entry2, "worker crashed again").await.unwrap();
        assert!(!requeued2);
        assert_eq!(queue.dead_letter_size().await, 1);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue = InProcessQueue::new(Duration::from_secs(900), 3);
        let result = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(result.is_none());
    }
}
