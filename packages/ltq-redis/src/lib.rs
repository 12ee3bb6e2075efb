#![crate_name = "ltq_redis"]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! # ltq-redis
//!
//! The Redis broker: per queue `Q` it keeps a `queue:{Q}` sorted set
//! (member = serialized message, score = visibility epoch seconds) and one
//! `processing:{Q}:{worker_id}` sorted set per consuming worker (score =
//! lease epoch seconds). Leasing and nacking are single server-side Lua
//! scripts, so no message is ever observable by two workers at once.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ltq_core::broker::{Broker, CONSUME_POLL_INTERVAL};
use ltq_core::error::BrokerError;
use ltq_core::message::Message;
use ltq_core::worker::WorkerId;
use redis::aio::MultiplexedConnection;
use redis::{Client, IntoConnectionInfo, Script};
use tracing::debug;

#[derive(Clone)]
struct RedisScripts {
    consume: Script,
    nack: Script,
    recover: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            consume: Script::new(include_str!("../lua/consume.lua")),
            nack: Script::new(include_str!("../lua/nack.lua")),
            recover: Script::new(include_str!("../lua/recover.lua")),
        }
    }
}

/// Broker backed by Redis sorted sets.
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    scripts: RedisScripts,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

fn processing_key(queue: &str, worker_id: &WorkerId) -> String {
    format!("processing:{queue}:{worker_id}")
}

fn processing_pattern(queue: &str) -> String {
    format!("processing:{queue}:*")
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn backend(err: redis::RedisError) -> BrokerError {
    BrokerError::Backend(Box::new(err))
}

impl RedisBroker {
    /// Connect to `redis://host:port[/db]`.
    pub async fn connect<S: IntoConnectionInfo>(url: S) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::Connection(Box::new(e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(Box::new(e)))?;
        Ok(Self::new(conn))
    }

    /// Build a broker over an existing connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            scripts: RedisScripts::new(),
        }
    }

    async fn processing_keys(&self, queue: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let pattern = processing_pattern(queue);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn fetch_due(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        count: usize,
    ) -> Result<Vec<Message>, BrokerError> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = self
            .scripts
            .consume
            .key(queue_key(queue))
            .key(processing_key(queue, worker_id))
            .arg(now_secs())
            .arg(count)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        payloads.iter().map(|raw| Message::decode(raw)).collect()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(
        &self,
        queue: &str,
        message: &Message,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let payload = message.encode()?;
        let score = now_secs() + delay.as_secs_f64();
        debug!(id = %message.id, queue, "publishing message");
        redis::cmd("ZADD")
            .arg(queue_key(queue))
            .arg(score)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn consume(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Message>, BrokerError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let leased = self.fetch_due(queue, worker_id, count).await?;
            if !leased.is_empty() {
                return Ok(leased);
            }
            let remaining = deadline - tokio::time::Instant::now();
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::time::sleep(remaining.min(CONSUME_POLL_INTERVAL)).await;
        }
    }

    async fn ack(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let payload = match message.leased_with() {
            Some(raw) => raw.to_owned(),
            None => message.encode()?,
        };
        redis::cmd("ZREM")
            .arg(processing_key(queue, worker_id))
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn nack(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        message: &Message,
        delay: Duration,
        drop: bool,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let leased = match message.leased_with() {
            Some(raw) => raw.to_owned(),
            None => message.encode()?,
        };
        let current = message.encode()?;
        let score = now_secs() + delay.as_secs_f64();
        self.scripts
            .nack
            .key(processing_key(queue, worker_id))
            .key(queue_key(queue))
            .arg(leased)
            .arg(if drop { "0" } else { "1" })
            .arg(score)
            .arg(current)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn recover(&self, queue: &str, older_than: Duration) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let now = now_secs();
        let cutoff = now - older_than.as_secs_f64();
        let mut reclaimed = 0u64;
        for key in self.processing_keys(queue).await? {
            let moved: u64 = self
                .scripts
                .recover
                .key(&key)
                .key(queue_key(queue))
                .arg(cutoff)
                .arg(now)
                .invoke_async(&mut conn)
                .await
                .map_err(backend)?;
            reclaimed += moved;
        }
        if reclaimed > 0 {
            debug!(queue, reclaimed, "reclaimed stale in-flight messages");
        }
        Ok(reclaimed)
    }

    async fn size(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(queue_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let mut keys = self.processing_keys(queue).await?;
        keys.push(queue_key(queue));
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }
}
