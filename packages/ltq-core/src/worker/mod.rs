//! The consuming side: leases messages, runs them through the middleware
//! pipeline, and translates outcomes into broker operations.

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::broker::Broker;
use crate::error::TaskError;
use crate::message::Message;
use crate::middleware::{self, Middleware, Next};
use crate::task::{Invocation, Task, TaskHandler, TaskOptions};

mod shutdown;

pub use shutdown::Shutdown;

/// Upper bound on one blocking consume call, kept small so shutdown stays
/// responsive.
const CONSUME_BLOCK: Duration = Duration::from_millis(500);
/// Messages leased in one consume call, permits allowing.
const MAX_LEASE_BATCH: usize = 32;
/// Pause after a transient consume failure.
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Default time in-flight processing gets to finish after shutdown.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Default lease age after which startup recovery reclaims messages left by
/// a crashed prior instance.
const DEFAULT_RECOVER_GRACE: Duration = Duration::from_secs(300);

/// Identity of one worker run: the worker name plus a fresh instance id.
///
/// The broker keys in-flight sets by this, so two runs of the same worker
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    name: String,
    instance: Ulid,
}

impl WorkerId {
    /// Mint an id for a new run of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: Ulid::new(),
        }
    }

    /// The worker name, without the instance suffix.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.instance)
    }
}

/// Configures and assembles a [`Worker`].
pub struct WorkerBuilder {
    name: String,
    broker: Arc<dyn Broker>,
    concurrency: usize,
    middlewares: Option<Vec<Arc<dyn Middleware>>>,
    drain_timeout: Duration,
    recover_grace: Option<Duration>,
}

impl WorkerBuilder {
    /// Start configuring a worker named `name` against `broker`.
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            name: name.into(),
            broker,
            concurrency: 100,
            middlewares: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            recover_grace: Some(DEFAULT_RECOVER_GRACE),
        }
    }

    /// Maximum messages processed at once (default 100).
    pub fn concurrency(mut self, limit: usize) -> Self {
        assert!(limit >= 1, "concurrency must be at least 1");
        self.concurrency = limit;
        self
    }

    /// Replace the default `[MaxTries, MaxAge, MaxRate]` stack.
    pub fn middlewares(mut self, stack: Vec<Arc<dyn Middleware>>) -> Self {
        self.middlewares = Some(stack);
        self
    }

    /// How long in-flight processing may keep running after shutdown
    /// (default 30s); unfinished messages are returned to the queue.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Lease age above which startup recovery reclaims in-flight messages
    /// (default 5 minutes). `None` skips recovery.
    pub fn recover_grace(mut self, grace: Option<Duration>) -> Self {
        self.recover_grace = grace;
        self
    }

    /// Assemble the worker.
    pub fn build(self) -> Worker {
        Worker {
            id: WorkerId::new(&self.name),
            name: self.name,
            broker: self.broker,
            tasks: HashMap::new(),
            middlewares: self.middlewares.unwrap_or_else(middleware::default_stack),
            concurrency: self.concurrency,
            drain_timeout: self.drain_timeout,
            recover_grace: self.recover_grace,
            shutdown: Shutdown::new(),
        }
    }
}

/// Consumes one or more queues with bounded concurrency.
pub struct Worker {
    name: String,
    id: WorkerId,
    broker: Arc<dyn Broker>,
    tasks: HashMap<String, Task>,
    middlewares: Vec<Arc<dyn Middleware>>,
    concurrency: usize,
    drain_timeout: Duration,
    recover_grace: Option<Duration>,
    shutdown: Shutdown,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id.to_string())
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl Worker {
    /// Start configuring a worker.
    pub fn builder(name: impl Into<String>, broker: Arc<dyn Broker>) -> WorkerBuilder {
        WorkerBuilder::new(name, broker)
    }

    /// The worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This run's identity.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The broker this worker consumes from.
    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// Handle that stops this worker; safe to clone into signal handlers.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub(crate) fn set_shutdown(&mut self, shutdown: Shutdown) {
        self.shutdown = shutdown;
    }

    /// Override the concurrency limit after construction (CLI flag).
    pub fn set_concurrency(&mut self, limit: usize) {
        assert!(limit >= 1, "concurrency must be at least 1");
        self.concurrency = limit;
    }

    /// Declare a task named `{worker}:{name}` and get back its producer
    /// handle.
    pub fn register<F, Fut>(&mut self, name: &str, options: TaskOptions, handler: F) -> Task
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let task_name = format!("{}:{}", self.name, name);
        let handler: TaskHandler = Arc::new(move |invocation| Box::pin(handler(invocation)));
        let task = Task::new(task_name.clone(), options, handler, self.broker.clone());
        self.tasks.insert(task_name, task.clone());
        task
    }

    /// Append a middleware to the stack (innermost position).
    pub fn register_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Insert a middleware at `index`; 0 is outermost.
    pub fn insert_middleware(&mut self, index: usize, middleware: Arc<dyn Middleware>) {
        self.middlewares.insert(index, middleware);
    }

    pub(crate) fn prepend_middlewares(&mut self, prefix: &[Arc<dyn Middleware>]) {
        self.middlewares.splice(0..0, prefix.iter().cloned());
    }

    /// Run until [`Shutdown`] is triggered, then drain and return leased
    /// messages that did not finish in time.
    pub async fn run(self) {
        self.run_inner(true).await;
    }

    /// Run until `signal` resolves (e.g. `tokio::signal::ctrl_c()`).
    pub async fn run_with_signal<S, E>(self, signal: S)
    where
        S: Future<Output = Result<(), E>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(shutdown.shutdown_after(async {
            let _ = signal.await;
        }));
        self.run().await;
    }

    pub(crate) async fn run_inner(self, close_broker: bool) {
        let queues: BTreeSet<String> = self
            .tasks
            .values()
            .map(|t| t.queue().to_owned())
            .collect();
        if queues.is_empty() {
            warn!(worker = %self.id, "no tasks registered, nothing to consume");
            return;
        }
        info!(worker = %self.id, queues = ?queues, concurrency = self.concurrency, "worker starting");

        if let Some(grace) = self.recover_grace {
            for queue in &queues {
                match self.broker.recover(queue, grace).await {
                    Ok(0) => {}
                    Ok(n) => info!(worker = %self.id, %queue, reclaimed = n, "recovered stale in-flight messages"),
                    Err(err) => warn!(worker = %self.id, %queue, %err, "startup recovery failed"),
                }
            }
        }

        let shared = Arc::new(Shared {
            id: self.id.clone(),
            broker: self.broker.clone(),
            tasks: self.tasks,
            middlewares: self.middlewares,
            semaphore: Arc::new(Semaphore::new(self.concurrency)),
            shutdown: self.shutdown.clone(),
        });
        let tracker = TaskTracker::new();
        let kill = CancellationToken::new();

        let mut consumers = JoinSet::new();
        for queue in queues {
            consumers.spawn(consume_loop(
                shared.clone(),
                queue,
                tracker.clone(),
                kill.clone(),
            ));
        }
        while consumers.join_next().await.is_some() {}

        tracker.close();
        if timeout(self.drain_timeout, tracker.wait()).await.is_err() {
            warn!(worker = %self.id, "drain deadline reached, returning unfinished messages");
            kill.cancel();
            tracker.wait().await;
        }

        if close_broker {
            if let Err(err) = self.broker.close().await {
                warn!(worker = %self.id, %err, "failed to close broker");
            }
        }
        info!(worker = %self.id, "worker stopped");
    }
}

struct Shared {
    id: WorkerId,
    broker: Arc<dyn Broker>,
    tasks: HashMap<String, Task>,
    middlewares: Vec<Arc<dyn Middleware>>,
    semaphore: Arc<Semaphore>,
    shutdown: Shutdown,
}

async fn consume_loop(
    shared: Arc<Shared>,
    queue: String,
    tracker: TaskTracker,
    kill: CancellationToken,
) {
    debug!(worker = %shared.id, %queue, "consuming");
    loop {
        // One permit per in-flight message; waiting here is what bounds the
        // worker's concurrency.
        let first = tokio::select! {
            _ = shared.shutdown.wait() => break,
            permit = shared.semaphore.clone().acquire_owned() => {
                permit.expect("worker semaphore closed")
            }
        };
        let mut permits = vec![first];
        while permits.len() < MAX_LEASE_BATCH {
            match shared.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let leased = tokio::select! {
            _ = shared.shutdown.wait() => break,
            result = shared
                .broker
                .consume(&queue, &shared.id, permits.len(), CONSUME_BLOCK) => result,
        };
        match leased {
            Ok(messages) => {
                let mut permits = permits.into_iter();
                for message in messages {
                    // Cannot run out: the broker leases at most `count`.
                    let permit = permits.next().expect("broker returned more than requested");
                    let shared = shared.clone();
                    let queue = queue.clone();
                    let kill = kill.clone();
                    tracker.spawn(async move {
                        let _permit = permit;
                        process(shared, &queue, message, kill).await;
                    });
                }
                // Remaining permits release on drop.
            }
            Err(err) => {
                warn!(worker = %shared.id, %queue, %err, "consume failed, backing off");
                drop(permits);
                tokio::select! {
                    _ = shared.shutdown.wait() => break,
                    _ = tokio::time::sleep(CONSUME_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!(worker = %shared.id, %queue, "consumption stopped");
}

async fn process(shared: Arc<Shared>, queue: &str, mut message: Message, kill: CancellationToken) {
    let Some(task) = shared.tasks.get(&message.task_name) else {
        warn!(worker = %shared.id, task = %message.task_name, id = %message.id, "message for unknown task dropped");
        nack(&shared, queue, &message, Duration::ZERO, true).await;
        return;
    };

    debug!(worker = %shared.id, id = %message.id, task = %message.task_name, "processing");
    let outcome = tokio::select! {
        _ = kill.cancelled() => None,
        result = Next::new(&shared.middlewares, task).run(&mut message) => Some(result),
    };
    let Some(outcome) = outcome else {
        // Drain deadline passed; give the message back for another worker.
        nack(&shared, queue, &message, Duration::ZERO, false).await;
        return;
    };

    match outcome {
        Ok(()) => {
            if let Err(err) = shared.broker.ack(queue, &shared.id, &message).await {
                error!(worker = %shared.id, id = %message.id, %err, "ack failed, message left for recovery");
            }
        }
        Err(TaskError::Retry { delay }) => {
            debug!(worker = %shared.id, id = %message.id, ?delay, "retrying");
            nack(&shared, queue, &message, delay, false).await;
        }
        Err(TaskError::Reject(reason)) => {
            warn!(worker = %shared.id, id = %message.id, %reason, "message rejected");
            nack(&shared, queue, &message, Duration::ZERO, true).await;
        }
        Err(TaskError::Failed(err)) => {
            error!(worker = %shared.id, id = %message.id, task = %message.task_name, %err, "task failed, message dropped");
            nack(&shared, queue, &message, Duration::ZERO, true).await;
        }
    }
}

async fn nack(shared: &Shared, queue: &str, message: &Message, delay: Duration, drop: bool) {
    if let Err(err) = shared
        .broker
        .nack(queue, &shared.id, message, delay, drop)
        .await
    {
        error!(worker = %shared.id, id = %message.id, %err, "nack failed, message left for recovery");
    }
}
