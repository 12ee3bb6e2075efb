//! The queue abstraction workers and producers talk to.
//!
//! A broker keeps, per queue, a visible set of messages ordered by
//! visibility time and one in-flight set per consuming worker. Delivery is
//! at-least-once: a consumed message stays in the worker's in-flight set
//! until it is acked, nacked, or reclaimed by [`Broker::recover`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::message::Message;
use crate::worker::WorkerId;

mod memory;

pub use memory::MemoryBroker;

/// How often blocking [`Broker::consume`] implementations re-check for due
/// messages.
pub const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An ordered, at-least-once message queue.
///
/// All operations take the queue name explicitly; queue names are opaque
/// strings. Implementations must be safe to call concurrently from every
/// fiber of a worker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Make `message` visible on `queue` at `now + delay`.
    ///
    /// Members of the visible set are keyed by the serialized payload, so
    /// republishing an unchanged message updates its visibility time rather
    /// than duplicating it.
    async fn publish(
        &self,
        queue: &str,
        message: &Message,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Atomically lease up to `count` due messages for `worker_id`.
    ///
    /// Waits at most `block` for the first message; returning fewer than
    /// `count` (including none) is always permitted. Leased messages move to
    /// the worker's in-flight set in the same step, so no other worker can
    /// observe them.
    async fn consume(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Message>, BrokerError>;

    /// Confirm completion: remove `message` from the in-flight set and
    /// discard it. Acking a message twice is a no-op.
    async fn ack(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        message: &Message,
    ) -> Result<(), BrokerError>;

    /// Report non-completion: remove `message` from the in-flight set and,
    /// unless `drop`, republish it (current `ctx` included) with visibility
    /// at `now + delay`.
    async fn nack(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        message: &Message,
        delay: Duration,
        drop: bool,
    ) -> Result<(), BrokerError>;

    /// Return in-flight messages whose lease is older than `older_than` to
    /// the visible set at `now`, across all workers of `queue`. Returns how
    /// many messages were reclaimed.
    async fn recover(&self, queue: &str, older_than: Duration) -> Result<u64, BrokerError>;

    /// Number of messages in the visible set, delayed ones included.
    async fn size(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Delete all visible and in-flight messages of `queue`.
    async fn clear(&self, queue: &str) -> Result<(), BrokerError>;

    /// Release the underlying transport.
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
