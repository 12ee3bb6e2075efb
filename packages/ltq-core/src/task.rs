//! Tasks bind a name and a queue to an async handler.
//!
//! A task is declared on a worker (`worker.register(...)`) and the returned
//! handle doubles as the producer API: [`Task::send`] serializes a call into
//! a [`Message`] and publishes it to the task's queue.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::broker::Broker;
use crate::error::{SendError, TaskError};
use crate::message::Message;

/// `N/u` executions-per-window limit, `u` one of `s`, `m`, `h`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    count: u32,
    per: Duration,
}

impl RateLimit {
    /// Allowed executions per second.
    pub fn per_second(&self) -> f64 {
        f64::from(self.count) / self.per.as_secs_f64()
    }

    /// Minimum spacing between two executions.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.per_second())
    }
}

impl FromStr for RateLimit {
    type Err = RateLimitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| RateLimitParseError(s.to_owned()))?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|_| RateLimitParseError(s.to_owned()))?;
        if count == 0 {
            return Err(RateLimitParseError(s.to_owned()));
        }
        let per = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            _ => return Err(RateLimitParseError(s.to_owned())),
        };
        Ok(Self { count, per })
    }
}

/// The rate string was not of the form `N/u` with `u` in `{s,m,h}`.
#[derive(Debug, thiserror::Error)]
#[error("invalid rate limit {0:?}, expected \"N/s\", \"N/m\" or \"N/h\"")]
pub struct RateLimitParseError(String);

/// Per-task configuration, immutable after declaration.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub(crate) max_tries: Option<u32>,
    pub(crate) max_age: Option<Duration>,
    pub(crate) max_rate: Option<RateLimit>,
    pub(crate) queue: Option<String>,
}

impl TaskOptions {
    /// No limits, default queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of executions; `n` must be at least 1.
    pub fn max_tries(mut self, n: u32) -> Self {
        assert!(n >= 1, "max_tries must be at least 1");
        self.max_tries = Some(n);
        self
    }

    /// Reject messages older than `age` at execution time.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Throttle executions to `limit` on each worker.
    pub fn max_rate(mut self, limit: RateLimit) -> Self {
        self.max_rate = Some(limit);
        self
    }

    /// Route this task through an explicitly named queue instead of its own.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    /// Configured execution cap, if any.
    pub fn get_max_tries(&self) -> Option<u32> {
        self.max_tries
    }

    /// Configured age cutoff, if any.
    pub fn get_max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// Configured rate limit, if any.
    pub fn get_max_rate(&self) -> Option<RateLimit> {
        self.max_rate
    }
}

/// Positional and keyword arguments of one call, serialized eagerly so that
/// unserializable values fail on the producer before anything is enqueued.
#[derive(Debug, Clone, Default)]
pub struct Args {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Args {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self, SendError> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set a keyword argument.
    pub fn kwarg<T: Serialize>(mut self, key: &str, value: T) -> Result<Self, SendError> {
        self.kwargs.insert(key.to_owned(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub(crate) fn into_parts(self) -> (Vec<Value>, Map<String, Value>) {
        (self.args, self.kwargs)
    }
}

/// The arguments a handler receives for one message.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

pub(crate) type TaskHandler =
    Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// A named unit of work bound to a worker's queue.
///
/// Cheap to clone; holds no per-call state.
#[derive(Clone)]
pub struct Task {
    name: Arc<str>,
    queue: Arc<str>,
    options: TaskOptions,
    handler: TaskHandler,
    broker: Arc<dyn Broker>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        name: String,
        options: TaskOptions,
        handler: TaskHandler,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let queue = options.queue.clone().unwrap_or_else(|| name.clone());
        Self {
            name: name.into(),
            queue: queue.into(),
            options,
            handler,
            broker,
        }
    }

    /// Full task name, `{worker}:{function}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue this task consumes from and publishes to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The task's declared options.
    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub(crate) fn handler(&self) -> &TaskHandler {
        &self.handler
    }

    /// Build a message for this task without publishing it.
    pub fn message(&self, args: Args) -> Message {
        let (args, kwargs) = args.into_parts();
        Message::new(self.name.as_ref(), args, kwargs)
    }

    /// Serialize a call and publish it with zero delay.
    pub async fn send(&self, args: Args) -> Result<(), SendError> {
        let message = self.message(args);
        self.broker
            .publish(&self.queue, &message, Duration::ZERO)
            .await?;
        Ok(())
    }

    /// Publish a batch of prebuilt messages.
    pub async fn send_bulk(&self, messages: &[Message]) -> Result<(), SendError> {
        for message in messages {
            self.broker
                .publish(&self.queue, message, Duration::ZERO)
                .await?;
        }
        Ok(())
    }
}
