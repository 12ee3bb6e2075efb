use std::future::Future;

use tokio_util::sync::CancellationToken;

/// A shared token that asks every holder to stop.
///
/// Cloned across a worker's fibers and across the workers of an [`App`];
/// triggering any clone triggers all of them.
///
/// [`App`]: crate::app::App
#[derive(Clone, Debug, Default)]
pub struct Shutdown(CancellationToken);

impl Shutdown {
    /// A fresh, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown on every clone.
    pub fn shutdown(&self) {
        self.0.cancel();
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutting_down(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolve once shutdown is triggered.
    pub async fn wait(&self) {
        self.0.cancelled().await;
    }

    /// Run `f` to completion, then trigger shutdown.
    pub fn shutdown_after<F: Future>(&self, f: F) -> impl Future<Output = F::Output> {
        let handle = self.clone();
        async move {
            let result = f.await;
            handle.shutdown();
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_the_trigger() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_shutting_down());

        shutdown.shutdown();
        assert!(clone.is_shutting_down());
        clone.wait().await;
    }

    #[tokio::test]
    async fn shutdown_after_fires_on_completion() {
        let shutdown = Shutdown::new();
        shutdown.shutdown_after(async {}).await;
        assert!(shutdown.is_shutting_down());
    }
}
