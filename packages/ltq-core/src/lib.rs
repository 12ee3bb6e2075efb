#![crate_name = "ltq_core"]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! # ltq-core
//!
//! Core primitives of the ltq task queue: messages, the broker contract and
//! its in-memory implementation, tasks, the middleware pipeline, workers and
//! the multi-worker [`App`] supervisor.
//!
//! Producers and consumers meet at a [`Broker`]; a [`Worker`] registers
//! tasks, leases their messages with bounded concurrency and translates
//! execution outcomes into acks and nacks:
//!
//! ```rust
//! use std::sync::Arc;
//! use ltq_core::broker::MemoryBroker;
//! use ltq_core::task::{Args, TaskOptions};
//! use ltq_core::worker::Worker;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//! let mut worker = Worker::builder("emails", broker.clone()).build();
//!
//! let send_email = worker.register("send_email", TaskOptions::new(), |inv| async move {
//!     println!("sending email to {}", inv.args[0]);
//!     Ok(())
//! });
//!
//! send_email.send(Args::new().arg("a@example.com")?).await?;
//!
//! let shutdown = worker.shutdown_handle();
//! tokio::spawn(async move {
//!     tokio::time::sleep(std::time::Duration::from_millis(200)).await;
//!     shutdown.shutdown();
//! });
//! worker.run().await;
//! # Ok(())
//! # }
//! ```

/// The multi-worker supervisor.
pub mod app;
/// The queue abstraction and the in-memory implementation.
pub mod broker;
/// Error types shared across the crate.
pub mod error;
/// The unit of work travelling through brokers.
pub mod message;
/// Scoped wrappers around task execution.
pub mod middleware;
/// Task declaration and the producer API.
pub mod task;
/// The consuming loop.
pub mod worker;

pub use app::App;
pub use broker::{Broker, MemoryBroker};
pub use error::{BoxDynError, BrokerError, SendError, TaskError};
pub use message::{Message, MessageId};
pub use middleware::Middleware;
pub use task::{Args, RateLimit, Task, TaskOptions};
pub use worker::{Shutdown, Worker, WorkerBuilder, WorkerId};
