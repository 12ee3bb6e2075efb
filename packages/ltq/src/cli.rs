//! CLI harness for worker binaries.
//!
//! Rust has no runtime symbol loading, so a binary links against its own
//! workers and hands the CLI a [`Registry`] of named constructors; the
//! target syntax stays `module:symbol`.
//!
//! ```rust,no_run
//! use ltq::cli::{self, Registry};
//! use ltq::prelude::*;
//!
//! fn emails(broker: std::sync::Arc<dyn Broker>) -> Worker {
//!     let mut worker = Worker::builder("emails", broker).build();
//!     worker.register("send_email", TaskOptions::new(), |_inv| async { Ok(()) });
//!     worker
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let registry = Registry::new().worker("emails:worker", emails);
//!     cli::run(registry).await
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use ltq_core::app::App;
use ltq_core::broker::Broker;
use ltq_core::worker::Worker;
use tracing::{error, info};

use crate::broker_from_url;

const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";

type WorkerFactory = Box<dyn FnOnce(Arc<dyn Broker>) -> Worker + Send>;
type AppFactory = Box<dyn FnOnce(Arc<dyn Broker>) -> App + Send>;

/// Named Worker and App constructors a binary exposes to the CLI.
#[derive(Default)]
pub struct Registry {
    workers: HashMap<String, WorkerFactory>,
    apps: HashMap<String, AppFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("apps", &self.apps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a worker constructor under a `module:symbol` target name.
    pub fn worker<F>(mut self, target: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(Arc<dyn Broker>) -> Worker + Send + 'static,
    {
        self.workers.insert(target.into(), Box::new(factory));
        self
    }

    /// Expose an app constructor under a `module:symbol` target name.
    pub fn app<F>(mut self, target: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(Arc<dyn Broker>) -> App + Send + 'static,
    {
        self.apps.insert(target.into(), Box::new(factory));
        self
    }
}

/// Run a ltq worker or manage queues.
#[derive(Parser, Debug)]
#[command(name = "ltq", version, about = "Run a ltq worker or manage queues")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a worker or app until interrupted.
    Run {
        /// Worker target (`module:symbol`).
        target: Option<String>,

        /// App target (`module:symbol`) instead of a single worker.
        #[arg(long)]
        app: Option<String>,

        /// Override the worker concurrency.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Broker url (`redis://…` or `memory://`).
        #[arg(long, default_value = DEFAULT_BROKER_URL)]
        broker_url: String,
    },

    /// Delete all messages of a queue.
    Clear {
        /// Queue name (`namespace:function`).
        queue: String,

        /// Redis url.
        #[arg(long, default_value = DEFAULT_BROKER_URL)]
        redis_url: String,
    },

    /// Print the number of visible messages of a queue.
    Size {
        /// Queue name (`namespace:function`).
        queue: String,

        /// Redis url.
        #[arg(long, default_value = DEFAULT_BROKER_URL)]
        redis_url: String,
    },
}

/// Parse the process arguments and dispatch against `registry`.
///
/// Exit codes: 0 on clean shutdown, 1 on unresolvable target or unreachable
/// broker, 2 on usage errors.
pub async fn run(registry: Registry) -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(2),
            };
        }
    };

    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Run {
            target,
            app,
            concurrency,
            broker_url,
        } => run_target(registry, target, app, concurrency, &broker_url).await,
        Commands::Clear { queue, redis_url } => {
            let broker = match connect(&redis_url).await {
                Ok(broker) => broker,
                Err(code) => return code,
            };
            if let Err(err) = broker.clear(&queue).await {
                error!(%err, %queue, "failed to clear queue");
                return ExitCode::from(1);
            }
            info!(%queue, "queue cleared");
            ExitCode::SUCCESS
        }
        Commands::Size { queue, redis_url } => {
            let broker = match connect(&redis_url).await {
                Ok(broker) => broker,
                Err(code) => return code,
            };
            match broker.size(&queue).await {
                Ok(size) => {
                    println!("{queue}: {size}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(%err, %queue, "failed to read queue size");
                    ExitCode::from(1)
                }
            }
        }
    }
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn connect(url: &str) -> Result<Arc<dyn Broker>, ExitCode> {
    broker_from_url(url).await.map_err(|err| {
        error!(%err, url, "broker unreachable");
        ExitCode::from(1)
    })
}

async fn run_target(
    registry: Registry,
    target: Option<String>,
    app: Option<String>,
    concurrency: Option<usize>,
    broker_url: &str,
) -> ExitCode {
    let (target, is_app) = match (target, app) {
        (Some(_), Some(_)) => {
            eprintln!("error: cannot specify both a worker target and --app");
            return ExitCode::from(2);
        }
        (None, None) => {
            eprintln!("error: either a worker target or --app is required");
            return ExitCode::from(2);
        }
        (Some(target), None) => (target, false),
        (None, Some(target)) => (target, true),
    };
    if !target.contains(':') {
        error!(%target, "invalid target, use module:symbol");
        return ExitCode::from(1);
    }

    let mut registry = registry;
    let broker = match connect(broker_url).await {
        Ok(broker) => broker,
        Err(code) => return code,
    };

    if is_app {
        let Some(factory) = registry.apps.remove(&target) else {
            error!(
                %target,
                known = ?registry.apps.keys().collect::<Vec<_>>(),
                "app target not registered"
            );
            return ExitCode::from(1);
        };
        let mut app = factory(broker);
        if let Some(limit) = concurrency {
            app.set_concurrency(limit);
        }
        info!(%target, "starting ltq app");
        app.run_with_signal(tokio::signal::ctrl_c()).await;
    } else {
        let Some(factory) = registry.workers.remove(&target) else {
            error!(
                %target,
                known = ?registry.workers.keys().collect::<Vec<_>>(),
                "worker target not registered"
            );
            return ExitCode::from(1);
        };
        let mut worker = factory(broker);
        if let Some(limit) = concurrency {
            worker.set_concurrency(limit);
        }
        info!(%target, "starting ltq worker");
        worker.run_with_signal(tokio::signal::ctrl_c()).await;
    }
    info!("shut down cleanly");
    ExitCode::SUCCESS
}
