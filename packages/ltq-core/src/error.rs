use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for boxed error causes carried inside ltq errors.
pub type BoxDynError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by broker implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The transport to the broker failed.
    #[error("broker connection error: {0}")]
    Connection(#[source] BoxDynError),

    /// The broker accepted the request but could not fulfil it.
    #[error("broker backend error: {0}")]
    Backend(#[source] BoxDynError),

    /// A message payload could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// `broker_from_url` was handed a url it cannot dispatch on.
    #[error("unknown broker scheme: {0}")]
    UnsupportedScheme(String),
}

/// The outcome signals a task body or middleware can raise.
///
/// The worker translates these into broker operations: [`TaskError::Retry`]
/// becomes a delayed nack, everything else drops the message.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Re-execute the message after `delay`.
    #[error("retry requested in {delay:?}")]
    Retry {
        /// How long the message stays invisible before redelivery.
        delay: Duration,
    },

    /// The message must not be processed; it is dropped with a warning.
    #[error("rejected: {0}")]
    Reject(String),

    /// The task body failed unexpectedly; the message is dropped.
    #[error("task failed: {0}")]
    Failed(#[source] BoxDynError),
}

impl TaskError {
    /// Request redelivery after `delay`.
    pub fn retry(delay: Duration) -> Self {
        TaskError::Retry { delay }
    }

    /// Drop the message with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        TaskError::Reject(reason.into())
    }
}

impl From<BoxDynError> for TaskError {
    fn from(err: BoxDynError) -> Self {
        TaskError::Failed(err)
    }
}

/// Errors raised synchronously from the producer side.
#[derive(Debug, Error)]
pub enum SendError {
    /// An argument could not be serialized; nothing was enqueued.
    #[error("unserializable argument: {0}")]
    Codec(#[from] serde_json::Error),

    /// The broker refused the publish.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
