//! Scoped wrappers around the execution of one message.
//!
//! A pipeline `[M₁, M₂, …, Mₙ]` nests execution: `M₁` is outermost, the task
//! body runs inside `Mₙ`. A middleware wraps the rest of the stack through
//! [`Next`]; returning an error before calling [`Next::run`] short-circuits
//! everything inside it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::TaskError;
use crate::message::Message;
use crate::task::{Invocation, Task};

mod max_age;
mod max_rate;
mod max_tries;

pub use max_age::MaxAge;
pub use max_rate::MaxRate;
pub use max_tries::MaxTries;

/// `ctx` key counting executions, maintained by [`MaxTries`].
pub const CTX_TRIES: &str = "tries";
/// `ctx` marker flagging a rate-limit retry, set by [`MaxRate`] and consumed
/// by [`MaxTries`].
pub const CTX_RATE_LIMITED: &str = "rate_limited";

/// A wrapper around the execution of one message.
///
/// Implementations may read and mutate `message.ctx`; mutations survive a
/// retry because the worker nacks the mutated message.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Run the scope: do work before, call `next.run(message)` to execute
    /// the inner layers and the task body, do work after.
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<(), TaskError>;
}

/// Handle to the remaining layers of the pipeline, ending in the task body.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    task: &'a Task,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stack: &'a [Arc<dyn Middleware>], task: &'a Task) -> Self {
        Self { rest: stack, task }
    }

    /// The task whose message is being processed.
    pub fn task(&self) -> &Task {
        self.task
    }

    /// Execute the remaining layers, then the task body.
    pub fn run<'b>(self, message: &'b mut Message) -> BoxFuture<'b, Result<(), TaskError>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((middleware, rest)) => {
                    let next = Next {
                        rest,
                        task: self.task,
                    };
                    middleware.handle(message, next).await
                }
                None => {
                    let invocation = Invocation {
                        args: message.args.clone(),
                        kwargs: message.kwargs.clone(),
                    };
                    (self.task.handler())(invocation).await
                }
            }
        })
    }
}

/// The stack workers get when none is specified.
pub fn default_stack() -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(MaxTries),
        Arc::new(MaxAge),
        Arc::new(MaxRate::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::task::TaskOptions;
    use std::sync::Mutex;

    fn probe_task() -> Task {
        Task::new(
            "tests:probe".into(),
            TaskOptions::new(),
            Arc::new(|_| Box::pin(async { Ok(()) })),
            MemoryBroker::new(),
        )
    }

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
    async fn stack_nests_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder {
                label: "a",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                label: "b",
                log: log.clone(),
            }),
        ];
        let task = probe_task();
        let mut message = task.message(crate::task::Args::new());

        Next::new(&stack, &task).run(&mut message).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter a", "enter b", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        struct Gate;

        #[async_trait]
        impl Middleware for Gate {
            async fn handle(&self, _: &mut Message, _: Next<'_>) -> Result<(), TaskError> {
                Err(TaskError::reject("closed"))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Gate),
            Arc::new(Recorder {
                label: "inner",
                log: log.clone(),
            }),
        ];
        let task = probe_task();
        let mut message = task.message(crate::task::Args::new());

        let result = Next::new(&stack, &task).run(&mut message).await;
        assert!(matches!(result, Err(TaskError::Reject(_))));
        assert!(log.lock().unwrap().is_empty());
    }
}
