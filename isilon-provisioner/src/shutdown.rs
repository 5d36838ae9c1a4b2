//! Graceful shutdown handling
//!
//! A SIGTERM/SIGINT cancels the root token; every in-flight provision or
//! delete holds a child of it and rolls back before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator for graceful termination
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    /// Flag indicating shutdown has started
    is_shutting_down: Arc<AtomicBool>,
    /// How long in-flight operations get to finish
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator with default 30s timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create with custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Token for one operation; cancelled when shutdown starts
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating graceful shutdown...");
        self.token.cancel();
    }

    /// Wait for shutdown signal from OS
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = self.token.cancelled() => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C");
                }
                _ = self.token.cancelled() => {}
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Get the configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.subscribe();

        assert!(!coordinator.is_shutting_down());
        assert!(!token.is_cancelled());

        coordinator.shutdown();

        assert!(coordinator.is_shutting_down());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_returns_after_manual_shutdown() {
        let coordinator = ShutdownCoordinator::with_timeout(Duration::from_secs(1));
        let trigger = coordinator.clone();
        tokio::spawn(async move { trigger.shutdown() });

        coordinator.wait_for_signal().await.unwrap();
        assert!(coordinator.is_shutting_down());
    }
}
