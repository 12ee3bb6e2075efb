use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;

use crate::error::TaskError;
use crate::message::Message;
use crate::middleware::{Middleware, Next, CTX_RATE_LIMITED};

/// Spaces executions of a task so at most `N` complete per window on this
/// worker.
///
/// The last-run table is shared across every message the worker processes;
/// throttled messages are retried after the remaining interval, jittered so
/// a backlog does not thunder back in one tick.
#[derive(Debug, Default)]
pub struct MaxRate {
    last_run: Mutex<HashMap<String, f64>>,
}

impl MaxRate {
    /// Fresh limiter with an empty last-run table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Middleware for MaxRate {
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<(), TaskError> {
        if let Some(rate) = next.task().options().get_max_rate() {
            let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
            let interval = rate.interval().as_secs_f64();

            let mut last_run = self.last_run.lock().expect("rate table poisoned");
            let last = last_run.get(message.task_name.as_str()).copied().unwrap_or(0.0);
            let elapsed = now - last;
            if elapsed < interval {
                drop(last_run);
                let base = interval - elapsed;
                let jitter = rand::rng().random_range(0.0..=base * 0.5);
                message
                    .ctx
                    .insert(CTX_RATE_LIMITED.to_owned(), json!(true));
                return Err(TaskError::retry(Duration::from_secs_f64(
                    base * 0.5 + jitter,
                )));
            }
            last_run.insert(message.task_name.clone(), now);
        }
        next.run(message).await
    }
}
