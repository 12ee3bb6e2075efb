//! Supervision of several workers in one process.
//!
//! Each registered worker runs as its own spawned task with its own
//! consumption fibers, so one worker's blocking behavior cannot stall
//! another. The app owns a shared [`Shutdown`] that stops all of them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::middleware::Middleware;
use crate::worker::{Shutdown, Worker};

/// Runs multiple workers concurrently with a shared middleware prefix.
#[derive(Default)]
pub struct App {
    workers: HashMap<String, Worker>,
    middlewares: Vec<Arc<dyn Middleware>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl App {
    /// An app with no workers and an empty middleware prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware to the app-level prefix.
    ///
    /// The prefix forms the outer layers of every worker registered *after*
    /// this call, so add middlewares before workers.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Attach a worker; the app prefix becomes its outermost layers and the
    /// app's shutdown replaces the worker's own.
    pub fn register_worker(mut self, mut worker: Worker) -> Self {
        worker.prepend_middlewares(&self.middlewares);
        worker.set_shutdown(self.shutdown.clone());
        self.workers.insert(worker.name().to_owned(), worker);
        self
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Override the concurrency limit of every registered worker.
    pub fn set_concurrency(&mut self, limit: usize) {
        for worker in self.workers.values_mut() {
            worker.set_concurrency(limit);
        }
    }

    /// Handle that stops every worker; safe to clone into signal handlers.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Ask every worker to shut down and drain.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    /// Run all workers until shutdown is triggered, then wait for each to
    /// drain and release the brokers.
    pub async fn run(self) {
        if self.workers.is_empty() {
            warn!("app has no registered workers");
            return;
        }
        info!(workers = self.workers.len(), "app starting");

        let mut brokers: Vec<Arc<dyn Broker>> = Vec::new();
        let mut running = JoinSet::new();
        for (_, worker) in self.workers {
            let broker = worker.broker();
            if !brokers.iter().any(|known| Arc::ptr_eq(known, &broker)) {
                brokers.push(broker);
            }
            // Workers close nothing themselves; shared brokers are released
            // once, below.
            running.spawn(worker.run_inner(false));
        }
        while running.join_next().await.is_some() {}

        for broker in brokers {
            if let Err(err) = broker.close().await {
                warn!(%err, "failed to close broker");
            }
        }
        info!("app stopped");
    }

    /// Run all workers until `signal` resolves (e.g.
    /// `tokio::signal::ctrl_c()`).
    pub async fn run_with_signal<S, E>(self, signal: S)
    where
        S: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(shutdown.shutdown_after(async {
            let _ = signal.await;
        }));
        self.run().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::error::TaskError;
    use crate::message::Message;
    use crate::middleware::Next;
    use crate::task::{Args, TaskOptions};

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("enter {}", self.label));
            let result = next.run(message).await;
            self.log.lock().unwrap().push(format!("exit {}", self.label));
            result
        }
    }

    #[tokio::test]
    async fn app_prefix_forms_the_outer_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let broker = MemoryBroker::new();

        let mut worker = Worker::builder("jobs", broker.clone())
            .recover_grace(None)
            .middlewares(vec![
                Arc::new(Recorder {
                    label: "b",
                    log: log.clone(),
                }),
                Arc::new(Recorder {
                    label: "c",
                    log: log.clone(),
                }),
            ])
            .build();
        let body_log = log.clone();
        let task = worker.register("traced", TaskOptions::new(), move |_| {
            let log = body_log.clone();
            async move {
                log.lock().unwrap().push("body".into());
                Ok(())
            }
        });
        task.send(Args::new()).await.unwrap();

        let app = App::new()
            .middleware(Arc::new(Recorder {
                label: "a",
                log: log.clone(),
            }))
            .register_worker(worker);
        let shutdown = app.shutdown_handle();

        let handle = tokio::spawn(app.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.shutdown();
        handle.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter a", "enter b", "enter c", "body", "exit c", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn stop_drains_every_worker() {
        let broker = MemoryBroker::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut emails = Worker::builder("emails", broker.clone())
            .recover_grace(None)
            .build();
        let counter = runs.clone();
        let send = emails.register("send", TaskOptions::new(), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let mut notify = Worker::builder("notifications", broker.clone())
            .recover_grace(None)
            .build();
        let counter = runs.clone();
        let push = notify.register("push", TaskOptions::new(), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        send.send(Args::new()).await.unwrap();
        push.send(Args::new()).await.unwrap();

        let app = App::new().register_worker(emails).register_worker(notify);
        assert_eq!(app.len(), 2);
        let shutdown = app.shutdown_handle();

        let handle = tokio::spawn(app.run());
        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown.shutdown();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
