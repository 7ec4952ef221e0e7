//! In-memory visibility-timeout queue.
//!
//! Items are handed out in insertion order with a fresh lease. A lease that
//! is neither renewed nor acknowledged before the visibility timeout makes
//! the item visible again. Failed acknowledgements are retried up to
//! `max_attempts` deliveries. Every operation can be slowed down with
//! [`Latency`] to reproduce a remote queue.
use std::collections::{BTreeMap, HashMap};

use leasekeeper_core::{LeaseQueue, LeaseToken, WorkItem};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token does not hold a lease: it was acknowledged, or its lease
    /// expired and the item went to another consumer.
    #[error("lost lease {0}")]
    LostLease(LeaseToken),
}

/// Artificial delay applied before each operation takes effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latency {
    pub enqueue: std::time::Duration,
    pub dequeue: std::time::Duration,
    pub extend: std::time::Duration,
    pub acknowledge: std::time::Duration,
}

impl Latency {
    /// Same delay for every operation.
    pub const fn uniform(delay: std::time::Duration) -> Self {
        Self {
            enqueue: delay,
            dequeue: delay,
            extend: delay,
            acknowledge: delay,
        }
    }

    pub fn extend(self, extend: std::time::Duration) -> Self {
        Self { extend, ..self }
    }

    pub fn dequeue(self, dequeue: std::time::Duration) -> Self {
        Self { dequeue, ..self }
    }

    pub fn acknowledge(self, acknowledge: std::time::Duration) -> Self {
        Self {
            acknowledge,
            ..self
        }
    }
}

#[derive(Debug)]
struct Lease {
    token: LeaseToken,
    deadline: Option<tokio::time::Instant>,
}

#[derive(Debug)]
struct Entry<T> {
    payload: T,
    deliveries: u32,
    failures: u32,
    lease: Option<Lease>,
}

impl<T> Entry<T> {
    fn is_visible(&self, now: tokio::time::Instant) -> bool {
        match &self.lease {
            None => true,
            Some(Lease {
                deadline: Some(deadline),
                ..
            }) => *deadline <= now,
            Some(Lease { deadline: None, .. }) => false,
        }
    }

    fn holds(&self, token: &LeaseToken) -> bool {
        self.lease.as_ref().is_some_and(|lease| &lease.token == token)
    }
}

#[derive(Debug)]
struct Inner<T> {
    next_id: u64,
    entries: BTreeMap<u64, Entry<T>>,
    acknowledgements: HashMap<LeaseToken, String>,
}

impl<T> Inner<T> {
    fn leased_id(&self, token: &LeaseToken) -> Result<u64, Error> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.holds(token))
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::LostLease(token.clone()))
    }
}

/// Queue kept in process memory.
#[derive(Debug)]
pub struct MemoryQueue<T> {
    inner: std::sync::Mutex<Inner<T>>,
    latency: Latency,
    visibility_timeout: Option<std::time::Duration>,
    max_attempts: u32,
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryQueue<T> {
    /// Leases never expire; a failed item is not retried.
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner {
                next_id: 1,
                entries: BTreeMap::new(),
                acknowledgements: HashMap::new(),
            }),
            latency: Latency::default(),
            visibility_timeout: None,
            max_attempts: 1,
        }
    }

    pub fn latency(self, latency: Latency) -> Self {
        Self { latency, ..self }
    }

    /// Let unrenewed leases expire after `timeout`.
    pub fn visibility_timeout(self, timeout: std::time::Duration) -> Self {
        Self {
            visibility_timeout: Some(timeout),
            ..self
        }
    }

    /// Deliveries allowed before a failing item is dropped. At least one.
    pub fn max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Items that a dequeue could hand out right now.
    pub fn pending(&self) -> usize {
        let now = tokio::time::Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.is_visible(now))
            .count()
    }

    /// Items currently held under an unexpired lease.
    pub fn leased(&self) -> usize {
        let now = tokio::time::Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|entry| !entry.is_visible(now))
            .count()
    }

    /// Items not yet finished, leased or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Error message recorded when `token` was acknowledged; empty for success.
    pub fn acknowledgement(&self, token: &LeaseToken) -> Option<String> {
        self.lock().acknowledgements.get(token).cloned()
    }

    /// Remove and return every recorded acknowledgement, ordered by token.
    ///
    /// Outcomes are kept until drained; long-running consumers should call
    /// this periodically.
    pub fn drain_acknowledgements(&self) -> Vec<(LeaseToken, String)> {
        let mut drained: Vec<_> = self.lock().acknowledgements.drain().collect();
        drained.sort_by(|(a, _), (b, _)| a.cmp(b));
        drained
    }
}

async fn delay(duration: std::time::Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

impl<T> LeaseQueue for MemoryQueue<T>
where
    T: Clone + Send + 'static,
{
    type Payload = T;
    type Error = Error;

    async fn enqueue(&self, payload: Self::Payload) -> Result<(), Self::Error> {
        delay(self.latency.enqueue).await;
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                payload,
                deliveries: 0,
                failures: 0,
                lease: None,
            },
        );
        tracing::trace!(id, "enqueued");
        Ok(())
    }

    async fn dequeue_one(&self) -> Result<Option<WorkItem<Self::Payload>>, Self::Error> {
        delay(self.latency.dequeue).await;
        let now = tokio::time::Instant::now();
        let deadline = self.visibility_timeout.map(|timeout| now + timeout);
        let mut inner = self.lock();
        let Some((id, entry)) = inner
            .entries
            .iter_mut()
            .find(|(_, entry)| entry.is_visible(now))
        else {
            return Ok(None);
        };

        if entry.lease.is_some() {
            tracing::debug!(id, "lease expired, redelivering");
        }
        entry.deliveries += 1;
        let token = LeaseToken::new(format!("{id}.{}", entry.deliveries));
        entry.lease = Some(Lease {
            token: token.clone(),
            deadline,
        });
        tracing::trace!(lease_token = %token, "dequeued");
        Ok(Some(WorkItem::from_parts(token, entry.payload.clone())))
    }

    async fn extend_lease(&self, token: &LeaseToken) -> Result<(), Self::Error> {
        delay(self.latency.extend).await;
        let deadline = self
            .visibility_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut inner = self.lock();
        let id = inner.leased_id(token)?;
        if let Some(lease) = inner
            .entries
            .get_mut(&id)
            .and_then(|entry| entry.lease.as_mut())
        {
            lease.deadline = deadline;
        }
        tracing::trace!(lease_token = %token, "lease extended");
        Ok(())
    }

    async fn acknowledge(&self, token: &LeaseToken, error_message: &str) -> Result<(), Self::Error> {
        delay(self.latency.acknowledge).await;
        let max_attempts = self.max_attempts;
        let mut inner = self.lock();
        let id = inner.leased_id(token)?;
        inner
            .acknowledgements
            .insert(token.clone(), error_message.to_owned());

        let retry = match inner.entries.get_mut(&id) {
            Some(entry) if !error_message.is_empty() => {
                entry.failures += 1;
                entry.lease = None;
                entry.failures < max_attempts
            }
            _ => false,
        };
        if retry {
            tracing::debug!(lease_token = %token, error = error_message, "failed, requeued");
        } else {
            inner.entries.remove(&id);
            tracing::trace!(lease_token = %token, "acknowledged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn hands_out_items_in_order() {
        let queue = MemoryQueue::new();
        queue.enqueue("first").await.unwrap();
        queue.enqueue("second").await.unwrap();
        assert_eq!(queue.pending(), 2);

        let item = queue.dequeue_one().await.unwrap().unwrap();
        assert_eq!(item.lease_token.as_str(), "1.1");
        assert_eq!(item.payload, "first");
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.leased(), 1);

        let item = queue.dequeue_one().await.unwrap().unwrap();
        assert_eq!(item.payload, "second");
        assert!(queue.dequeue_one().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_records_outcome() {
        let queue = MemoryQueue::new();
        queue.enqueue(1_u32).await.unwrap();
        let item = queue.dequeue_one().await.unwrap().unwrap();

        queue
            .acknowledge(&item.lease_token, "error for 1")
            .await
            .unwrap();
        assert!(queue.is_empty());
        assert_eq!(
            queue.acknowledgement(&item.lease_token).as_deref(),
            Some("error for 1")
        );

        let err = queue.acknowledge(&item.lease_token, "").await.unwrap_err();
        assert!(matches!(err, Error::LostLease(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn drained_acknowledgements_are_forgotten() {
        let queue = MemoryQueue::new();
        queue.enqueue("ok").await.unwrap();
        queue.enqueue("bad").await.unwrap();
        for message in ["", "boom"] {
            let item = queue.dequeue_one().await.unwrap().unwrap();
            queue.acknowledge(&item.lease_token, message).await.unwrap();
        }

        assert_eq!(
            queue.drain_acknowledgements(),
            vec![
                (LeaseToken::from("1.1"), String::new()),
                (LeaseToken::from("2.1"), "boom".to_owned()),
            ]
        );
        assert!(queue.drain_acknowledgements().is_empty());
        assert_eq!(queue.acknowledgement(&LeaseToken::from("1.1")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered() {
        let queue = MemoryQueue::new().visibility_timeout(Duration::from_secs(3));
        queue.enqueue("job").await.unwrap();
        let first = queue.dequeue_one().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.dequeue_one().await.unwrap().is_none());
        queue.extend_lease(&first.lease_token).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.dequeue_one().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = queue.dequeue_one().await.unwrap().unwrap();
        assert_eq!(second.lease_token.as_str(), "1.2");

        let err = queue.extend_lease(&first.lease_token).await.unwrap_err();
        assert!(matches!(err, Error::LostLease(_)));
        queue.acknowledge(&second.lease_token, "").await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_up_to_max_attempts() {
        let queue = MemoryQueue::new().max_attempts(2);
        queue.enqueue("flaky").await.unwrap();

        let item = queue.dequeue_one().await.unwrap().unwrap();
        queue.acknowledge(&item.lease_token, "boom").await.unwrap();
        assert_eq!(queue.pending(), 1);

        let item = queue.dequeue_one().await.unwrap().unwrap();
        assert_eq!(item.lease_token.as_str(), "1.2");
        queue.acknowledge(&item.lease_token, "boom").await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_operations() {
        let queue = MemoryQueue::new().latency(Latency::uniform(Duration::from_secs(1)));
        let start = tokio::time::Instant::now();
        queue.enqueue(()).await.unwrap();
        queue.dequeue_one().await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
