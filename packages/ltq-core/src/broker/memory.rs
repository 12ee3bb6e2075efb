use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::broker::{Broker, CONSUME_POLL_INTERVAL};
use crate::error::BrokerError;
use crate::message::Message;
use crate::worker::WorkerId;

// Mirrors the redis layout: member -> score. Insertion order breaks
// same-score ties.
#[derive(Debug, Default)]
struct QueueState {
    visible: HashMap<String, (f64, u64)>,
    in_flight: HashMap<String, HashMap<String, f64>>,
}

/// Single-process broker with the same contract as the Redis one.
///
/// Messages still round-trip through their wire form so `ctx` persistence
/// behaves exactly as it does against a real broker.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Notify,
    seq: AtomicU64,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn now() -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    fn take_due(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        count: usize,
    ) -> Result<Vec<Message>, BrokerError> {
        let now = Self::now();
        let mut queues = self.queues.lock().expect("queue map poisoned");
        let state = queues.entry(queue.to_owned()).or_default();

        let mut due: Vec<(f64, u64, String)> = state
            .visible
            .iter()
            .filter(|(_, (score, _))| *score <= now)
            .map(|(payload, (score, seq))| (*score, *seq, payload.clone()))
            .collect();
        due.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        due.truncate(count);

        let in_flight = state.in_flight.entry(worker_id.to_string()).or_default();
        let mut leased = Vec::with_capacity(due.len());
        for (_, _, payload) in due {
            state.visible.remove(&payload);
            in_flight.insert(payload.clone(), now);
            leased.push(Message::decode(&payload)?);
        }
        Ok(leased)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        message: &Message,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let payload = message.encode()?;
        let score = Self::now() + delay.as_secs_f64();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut queues = self.queues.lock().expect("queue map poisoned");
            queues
                .entry(queue.to_owned())
                .or_default()
                .visible
                .insert(payload, (score, seq));
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Message>, BrokerError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let leased = self.take_due(queue, worker_id, count)?;
            if !leased.is_empty() {
                return Ok(leased);
            }
            let remaining = deadline - tokio::time::Instant::now();
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // A publish wakes us early; delayed messages come due on the
            // next poll tick.
            let _ = timeout(
                remaining.min(CONSUME_POLL_INTERVAL),
                self.published.notified(),
            )
            .await;
        }
    }

    async fn ack(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let payload = match message.leased_with() {
            Some(raw) => raw.to_owned(),
            None => message.encode()?,
        };
        let mut queues = self.queues.lock().expect("queue map poisoned");
        if let Some(state) = queues.get_mut(queue) {
            if let Some(in_flight) = state.in_flight.get_mut(&worker_id.to_string()) {
                in_flight.remove(&payload);
            }
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        message: &Message,
        delay: Duration,
        drop: bool,
    ) -> Result<(), BrokerError> {
        self.ack(queue, worker_id, message).await?;
        if !drop {
            self.publish(queue, message, delay).await?;
        }
        Ok(())
    }

    async fn recover(&self, queue: &str, older_than: Duration) -> Result<u64, BrokerError> {
        let now = Self::now();
        let cutoff = now - older_than.as_secs_f64();
        let mut reclaimed = 0u64;
        let mut queues = self.queues.lock().expect("queue map poisoned");
        if let Some(state) = queues.get_mut(queue) {
            for in_flight in state.in_flight.values_mut() {
                let stale: Vec<String> = in_flight
                    .iter()
                    .filter(|(_, leased_at)| **leased_at <= cutoff)
                    .map(|(payload, _)| payload.clone())
                    .collect();
                for payload in stale {
                    in_flight.remove(&payload);
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    state.visible.insert(payload, (now, seq));
                    reclaimed += 1;
                }
            }
        }
        drop(queues);
        if reclaimed > 0 {
            self.published.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn size(&self, queue: &str) -> Result<u64, BrokerError> {
        let queues = self.queues.lock().expect("queue map poisoned");
        Ok(queues.get(queue).map_or(0, |s| s.visible.len() as u64))
    }

    async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        queues.remove(queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn message(task: &str) -> Message {
        Message::new(task, vec![json!("x")], Map::new())
    }

    fn worker() -> WorkerId {
        WorkerId::new("tests")
    }

    #[tokio::test]
    async fn publish_then_consume_then_ack() {
        let broker = MemoryBroker::new();
        let w = worker();
        let m = message("q:f");

        broker.publish("q:f", &m, Duration::ZERO).await.unwrap();
        assert_eq!(broker.size("q:f").await.unwrap(), 1);

        let leased = broker
            .consume("q:f", &w, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0], m);
        assert_eq!(broker.size("q:f").await.unwrap(), 0);

        broker.ack("q:f", &w, &leased[0]).await.unwrap();
        // Acking again is a no-op.
        broker.ack("q:f", &w, &leased[0]).await.unwrap();
    }

    #[tokio::test]
    async fn delayed_message_is_invisible_until_due() {
        let broker = MemoryBroker::new();
        let w = worker();
        broker
            .publish("q:f", &message("q:f"), Duration::from_millis(300))
            .await
            .unwrap();

        let early = broker
            .consume("q:f", &w, 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let due = broker
            .consume("q:f", &w, 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn nack_returns_mutated_ctx_to_visibility() {
        let broker = MemoryBroker::new();
        let w = worker();
        broker
            .publish("q:f", &message("q:f"), Duration::ZERO)
            .await
            .unwrap();

        let mut leased = broker
            .consume("q:f", &w, 1, Duration::from_millis(50))
            .await
            .unwrap()
            .remove(0);
        leased.ctx.insert("tries".into(), json!(1));
        broker
            .nack("q:f", &w, &leased, Duration::ZERO, false)
            .await
            .unwrap();

        let again = broker
            .consume("q:f", &w, 1, Duration::from_millis(50))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(again.id, leased.id);
        assert_eq!(again.ctx["tries"], json!(1));
        // In-flight no longer holds the original lease.
        assert_eq!(broker.recover("q:f", Duration::ZERO).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drop_nack_discards() {
        let broker = MemoryBroker::new();
        let w = worker();
        broker
            .publish("q:f", &message("q:f"), Duration::ZERO)
            .await
            .unwrap();
        let leased = broker
            .consume("q:f", &w, 1, Duration::from_millis(50))
            .await
            .unwrap()
            .remove(0);

        broker
            .nack("q:f", &w, &leased, Duration::ZERO, true)
            .await
            .unwrap();
        assert_eq!(broker.size("q:f").await.unwrap(), 0);
        assert_eq!(broker.recover("q:f", Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_honors_lease_age() {
        let broker = MemoryBroker::new();
        let w = worker();
        broker
            .publish("q:f", &message("q:f"), Duration::ZERO)
            .await
            .unwrap();
        let _leased = broker
            .consume("q:f", &w, 1, Duration::from_millis(50))
            .await
            .unwrap();

        // Young lease survives.
        assert_eq!(
            broker.recover("q:f", Duration::from_secs(60)).await.unwrap(),
            0
        );
        // Zero grace reclaims it.
        assert_eq!(broker.recover("q:f", Duration::ZERO).await.unwrap(), 1);
        assert_eq!(broker.size("q:f").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn consume_is_ordered_by_visibility_time() {
        let broker = MemoryBroker::new();
        let w = worker();
        let first = message("q:f");
        let second = message("q:f");
        broker
            .publish("q:f", &second, Duration::from_millis(20))
            .await
            .unwrap();
        broker.publish("q:f", &first, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let leased = broker
            .consume("q:f", &w, 2, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(leased[0].id, first.id);
        assert_eq!(leased[1].id, second.id);
    }

    #[tokio::test]
    async fn clear_wipes_visible_and_in_flight() {
        let broker = MemoryBroker::new();
        let w = worker();
        broker
            .publish("q:f", &message("q:f"), Duration::ZERO)
            .await
            .unwrap();
        broker
            .publish("q:f", &message("q:f"), Duration::ZERO)
            .await
            .unwrap();
        let _ = broker
            .consume("q:f", &w, 1, Duration::from_millis(50))
            .await
            .unwrap();

        broker.clear("q:f").await.unwrap();
        assert_eq!(broker.size("q:f").await.unwrap(), 0);
        assert_eq!(broker.recover("q:f", Duration::ZERO).await.unwrap(), 0);
    }
}
