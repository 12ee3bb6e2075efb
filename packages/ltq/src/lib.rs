#![crate_name = "ltq"]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! # ltq
//!
//! A simple, extensible distributed task queue. Producers enqueue named
//! units of work to a shared broker; workers consume, execute and
//! acknowledge them, with retries, rate limiting, age-based rejection,
//! cron-scheduled dispatch and middleware-based extensibility.
//!
//! ```rust,no_run
//! use ltq::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = broker_from_url("redis://127.0.0.1:6379").await?;
//!
//!     let mut worker = Worker::builder("emails", broker).build();
//!     let send_email = worker.register(
//!         "send_email",
//!         TaskOptions::new().max_tries(3),
//!         |inv| async move {
//!             println!("sending email to {}", inv.args[0]);
//!             Ok(())
//!         },
//!     );
//!
//!     send_email.send(Args::new().arg("a@example.com")?).await?;
//!     worker.run_with_signal(tokio::signal::ctrl_c()).await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use ltq_core::broker::{Broker, MemoryBroker};

/// The CLI harness for worker binaries.
pub mod cli;

pub use ltq_core::{
    App, Args, BoxDynError, BrokerError, Message, MessageId, Middleware, RateLimit, SendError,
    Shutdown, Task, TaskError, TaskOptions, Worker, WorkerBuilder, WorkerId,
};
pub use ltq_cron::{Scheduler, SchedulerHandle};
pub use ltq_redis::RedisBroker;

/// Everything a worker binary typically needs.
pub mod prelude {
    pub use crate::broker_from_url;
    pub use ltq_core::app::App;
    pub use ltq_core::broker::{Broker, MemoryBroker};
    pub use ltq_core::error::{BrokerError, SendError, TaskError};
    pub use ltq_core::message::{Message, MessageId};
    pub use ltq_core::middleware::{Middleware, Next};
    pub use ltq_core::task::{Args, RateLimit, Task, TaskOptions};
    pub use ltq_core::worker::{Shutdown, Worker, WorkerId};
    pub use ltq_cron::Scheduler;
    pub use ltq_redis::RedisBroker;
}

/// Build a broker from a url, dispatching on its scheme:
/// `redis://host:port[/db]` or `memory://`.
pub async fn broker_from_url(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    let parsed =
        url::Url::parse(url).map_err(|_| BrokerError::UnsupportedScheme(url.to_owned()))?;
    match parsed.scheme() {
        "redis" => Ok(Arc::new(RedisBroker::connect(url).await?)),
        "memory" => Ok(MemoryBroker::new()),
        scheme => Err(BrokerError::UnsupportedScheme(scheme.to_owned())),
    }
}
