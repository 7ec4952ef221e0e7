//! Queue-facing contract: enqueue, lease one item, renew, acknowledge.
//!
//! The driver never interprets a [`LeaseToken`]; it threads the token it got
//! from [`LeaseQueue::dequeue_one`] back into renewal and acknowledgement.
//! Persistence, retry policy and what happens to abandoned leases all stay
//! behind the trait boundary.
//!
//! Why:
//! - Tokens stay opaque so any backend (receipt handles, row ids) fits.
//! - Acknowledge carries the error text instead of a status enum; the queue
//!   decides whether a failure is retried.
mod tmp {
    use super::{LeaseToken, WorkItem};

    /// Lease-based work queue consumed by the driver.
    #[trait_variant::make(LeaseQueue: Send)]
    pub trait LocalLeaseQueue {
        /// Payload carried by each work item.
        type Payload: Send + 'static;
        /// Backend-specific failure.
        type Error: std::error::Error + Send + Sync + 'static;

        /// Add an item to the queue.
        async fn enqueue(&self, payload: Self::Payload) -> Result<(), Self::Error>;

        /// Take the next visible item with a fresh lease, or `None` when the
        /// queue is empty.
        async fn dequeue_one(&self) -> Result<Option<WorkItem<Self::Payload>>, Self::Error>;

        /// Renew the lease identified by `token`.
        async fn extend_lease(&self, token: &LeaseToken) -> Result<(), Self::Error>;

        /// Mark the leased item done. An empty `error_message` is a success.
        async fn acknowledge(
            &self,
            token: &LeaseToken,
            error_message: &str,
        ) -> Result<(), Self::Error>;
    }
}

pub use tmp::{LeaseQueue, LocalLeaseQueue};

/// Opaque handle for a lease granted by the queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LeaseToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LeaseToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Pair of lease token and payload handed out by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub lease_token: LeaseToken,
    pub payload: T,
}

impl<T> WorkItem<T> {
    /// Build an item from its token and payload.
    pub fn from_parts(lease_token: LeaseToken, payload: T) -> Self {
        Self {
            lease_token,
            payload,
        }
    }

    /// Separate token and payload.
    pub fn split_parts(self) -> (LeaseToken, T) {
        (self.lease_token, self.payload)
    }
}
