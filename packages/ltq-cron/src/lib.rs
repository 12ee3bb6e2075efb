#![crate_name = "ltq_cron"]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! # ltq-cron
//!
//! A cron-driven producer: each entry pairs a schedule with a prototype
//! [`Message`]; at every fire instant a fresh copy of the prototype is
//! published to the broker. Expressions use the `cron` crate's syntax
//! (seconds field included), e.g. `"0 */5 * * * *"` for every five minutes.
//!
//! ```rust,no_run
//! use ltq_core::broker::MemoryBroker;
//! use ltq_core::message::Message;
//! use ltq_cron::Scheduler;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//! let mut scheduler = Scheduler::new(broker);
//! let digest = Message::new("emails:daily_digest", Vec::new(), Default::default());
//! scheduler.cron("0 0 8 * * *", digest)?;
//! scheduler.run().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use ltq_core::broker::Broker;
use ltq_core::message::Message;
use ltq_core::worker::Shutdown;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Default pause between wake-ups when no entry is due sooner.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The cron expression could not be parsed.
#[derive(Debug, Error)]
#[error("invalid cron expression {expr:?}: {source}")]
pub struct ScheduleError {
    expr: String,
    #[source]
    source: cron::error::Error,
}

struct Entry {
    schedule: Schedule,
    queue: String,
    prototype: Message,
    next_run: Option<DateTime<Utc>>,
}

impl Entry {
    fn advance(&mut self, after: DateTime<Utc>) {
        self.next_run = self.schedule.after(&after).next();
    }
}

/// Publishes prototype messages on cron schedules.
pub struct Scheduler {
    broker: Arc<dyn Broker>,
    entries: Vec<Entry>,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.entries.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// A background scheduler run started by [`Scheduler::start_background`].
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        let _ = self.handle.await;
    }
}

impl Scheduler {
    /// A scheduler with no entries against `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            entries: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown: Shutdown::new(),
        }
    }

    /// Change how long the loop sleeps when nothing is due (default 10s).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Schedule `prototype` on `expr`, publishing to the queue named by its
    /// `task_name`. Entries registered first fire first on same-instant
    /// ties.
    pub fn cron(&mut self, expr: &str, prototype: Message) -> Result<(), ScheduleError> {
        let queue = prototype.task_name.clone();
        self.cron_to(expr, queue, prototype)
    }

    /// Schedule `prototype` on `expr`, publishing to an explicit queue.
    pub fn cron_to(
        &mut self,
        expr: &str,
        queue: impl Into<String>,
        prototype: Message,
    ) -> Result<(), ScheduleError> {
        let schedule = Schedule::from_str(expr).map_err(|source| ScheduleError {
            expr: expr.to_owned(),
            source,
        })?;
        let next_run = schedule.upcoming(Utc).next();
        self.entries.push(Entry {
            schedule,
            queue: queue.into(),
            prototype,
            next_run,
        });
        Ok(())
    }

    /// Handle that stops the loop; safe to clone into signal handlers.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is triggered.
    pub async fn run(mut self) {
        info!(entries = self.entries.len(), "scheduler starting");
        for entry in &self.entries {
            info!(
                task = %entry.prototype.task_name,
                queue = %entry.queue,
                next = ?entry.next_run,
                "scheduled"
            );
        }

        loop {
            let now = Utc::now();
            for entry in &mut self.entries {
                let Some(next_run) = entry.next_run else {
                    continue;
                };
                if next_run > now {
                    continue;
                }
                // Fresh id and created_at per fire; the prototype itself is
                // never enqueued.
                let message = entry.prototype.restamp();
                match self
                    .broker
                    .publish(&entry.queue, &message, Duration::ZERO)
                    .await
                {
                    Ok(()) => {
                        info!(
                            task = %message.task_name,
                            id = %message.id,
                            scheduled = %next_run,
                            "enqueued scheduled message"
                        );
                        entry.advance(now);
                    }
                    Err(err) => {
                        // Leave next_run untouched: the slot fires again on
                        // the next tick instead of being dropped.
                        error!(task = %entry.prototype.task_name, %err, "failed to enqueue scheduled message");
                    }
                }
            }

            let sleep_for = self
                .entries
                .iter()
                .filter_map(|e| e.next_run)
                .min()
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.poll_interval)
                .min(self.poll_interval);
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("scheduler stopped");
    }

    /// Run the loop off the caller's control flow.
    pub fn start_background(self) -> SchedulerHandle {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(self.run());
        SchedulerHandle { shutdown, handle }
    }
}
