use async_trait::async_trait;

use crate::error::TaskError;
use crate::message::Message;
use crate::middleware::{Middleware, Next};

/// Rejects a message whose age exceeds the task's `max_age` before the body
/// is entered.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAge;

#[async_trait]
impl Middleware for MaxAge {
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> Result<(), TaskError> {
        if let Some(max_age) = next.task().options().get_max_age() {
            let age = message.age().to_std().unwrap_or_default();
            if age > max_age {
                return Err(TaskError::reject(format!(
                    "message {} too old: {age:?} > {max_age:?}",
                    message.id
                )));
            }
        }
        next.run(message).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::task::{Args, Task, TaskOptions};

    fn noop_task(options: TaskOptions) -> Task {
        Task::new(
            "tests:noop".into(),
            options,
            Arc::new(|_| Box::pin(async { Ok(()) })),
            MemoryBroker::new(),
        )
    }

    #[tokio::test]
    async fn fresh_message_passes() {
        let task = noop_task(TaskOptions::new().max_age(Duration::from_secs(60)));
        let mut message = task.message(Args::new());
        let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(MaxAge)];
        assert!(Next::new(&stack, &task).run(&mut message).await.is_ok());
    }

    #[tokio::test]
    async fn stale_message_is_rejected() {
        let task = noop_task(TaskOptions::new().max_age(Duration::from_secs(1)));
        let mut message = task.message(Args::new());
        message.created_at = Utc::now() - chrono::Duration::seconds(5);

        let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(MaxAge)];
        let result = Next::new(&stack, &task).run(&mut message).await;
        assert!(matches!(result, Err(TaskError::Reject(_))));
    }
}
