use async_trait::async_trait;
use serde_json::json;

use crate::error::TaskError;
use crate::message::Message;
use crate::middleware::{Middleware, Next, CTX_RATE_LIMITED, CTX_TRIES};

/// Rejects a message once it has been executed `max_tries` times.
///
/// The try counter lives in `ctx["tries"]` so it survives redelivery.
/// Rate-limit retries are not executions and do not consume a try.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxTries;

#[async_trait]
impl Middleware for MaxTries {
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<(), TaskError> {
        if let Some(max_tries) = next.task().options().get_max_tries() {
            let tries = message
                .ctx
                .get(CTX_TRIES)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if tries >= u64::from(max_tries) {
                return Err(TaskError::reject(format!(
                    "message {} exceeded {max_tries} tries",
                    message.id
                )));
            }
        }

        let result = next.run(message).await;
        if result.is_err() {
            let rate_limited = message
                .ctx
                .remove(CTX_RATE_LIMITED)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !rate_limited {
                let tries = message
                    .ctx
                    .get(CTX_TRIES)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                message.ctx.insert(CTX_TRIES.to_owned(), json!(tries + 1));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::task::{Args, Task, TaskOptions};

    fn failing_task(options: TaskOptions) -> Task {
        Task::new(
            "tests:flaky".into(),
            options,
            Arc::new(|_| {
                Box::pin(async { Err(TaskError::retry(Duration::from_millis(1))) })
            }),
            MemoryBroker::new(),
        )
    }

    async fn run_once(task: &Task, message: &mut Message) -> Result<(), TaskError> {
        let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(MaxTries)];
        Next::new(&stack, task).run(message).await
    }

    #[tokio::test]
    async fn counts_tries_and_rejects_at_cap() {
        let task = failing_task(TaskOptions::new().max_tries(2));
        let mut message = task.message(Args::new());

        assert!(matches!(
            run_once(&task, &mut message).await,
            Err(TaskError::Retry { .. })
        ));
        assert_eq!(message.ctx[CTX_TRIES], json!(1));

        assert!(matches!(
            run_once(&task, &mut message).await,
            Err(TaskError::Retry { .. })
        ));
        assert_eq!(message.ctx[CTX_TRIES], json!(2));

        // Third attempt is rejected before the body runs.
        assert!(matches!(
            run_once(&task, &mut message).await,
            Err(TaskError::Reject(_))
        ));
    }

    #[tokio::test]
    async fn rate_limited_retries_are_free() {
        let task = failing_task(TaskOptions::new().max_tries(1));
        let mut message = task.message(Args::new());
        message
            .ctx
            .insert(CTX_RATE_LIMITED.to_owned(), json!(true));

        let _ = run_once(&task, &mut message).await;
        assert!(message.ctx.get(CTX_TRIES).is_none());
        assert!(message.ctx.get(CTX_RATE_LIMITED).is_none());
    }

    #[tokio::test]
    async fn unlimited_without_option() {
        let task = failing_task(TaskOptions::new());
        let mut message = task.message(Args::new());
        for expected in 1..=5u64 {
            let _ = run_once(&task, &mut message).await;
            assert_eq!(message.ctx[CTX_TRIES], json!(expected));
        }
    }
}
