use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use eyre::Result;
use thiserror::Error;
use tokio::{signal, sync::broadcast};

use crate::config::models::ShutdownConfig;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from inside the process
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Terminate => f.write_str("terminate"),
            ShutdownReason::Requested => f.write_str("requested"),
        }
    }
}

/// Ways a shutdown can fail to complete cleanly.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("in-flight requests did not finish within the {0:?} grace period")]
    GracePeriodExceeded(Duration),

    #[error("{outstanding} background task(s) still running after waiting {waited:?}")]
    BackgroundDrainTimeout { outstanding: usize, waited: Duration },

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Broadcasts a single shutdown request to every interested task and carries
/// the time budgets for draining.
pub struct GracefulShutdown {
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    /// Why shutdown started; set exactly once
    reason: Arc<OnceLock<ShutdownReason>>,
    /// How long in-flight requests may take once the listener closes
    grace_period: Duration,
    /// How long background tasks may take after the server stops
    background_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a shutdown manager with the default 5 s grace period and 30 s
    /// background drain budget
    pub fn new() -> Self {
        Self::from_config(&ShutdownConfig::default())
    }

    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::with_timeouts(config.grace_period(), config.background_timeout())
    }

    pub fn with_timeouts(grace_period: Duration, background_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            reason: Arc::new(OnceLock::new()),
            grace_period,
            background_timeout,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn background_timeout(&self) -> Duration {
        self.background_timeout
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The reason shutdown was started for, once it has been.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Start shutdown from inside the process. Returns `false` if shutdown was
    /// already under way.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        self.initiate_shutdown(reason)
    }

    /// Wait for SIGINT or SIGTERM and broadcast the shutdown. Returns once a
    /// signal arrived or shutdown was triggered some other way.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");
        let mut token = self.shutdown_token();

        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                tracing::info!(signal = "SIGINT", "Caught signal, shutting down server");
                self.initiate_shutdown(ShutdownReason::Interrupt);
            }
            res = wait_for_sigterm() => {
                res?;
                tracing::info!(signal = "SIGTERM", "Caught signal, shutting down server");
                self.initiate_shutdown(ShutdownReason::Terminate);
            }
            reason = token.wait_for_shutdown() => {
                tracing::debug!(%reason, "Shutdown triggered without a signal");
            }
        }

        Ok(())
    }

    fn initiate_shutdown(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_ok() {
            tracing::info!(%reason, "Shutdown initiated");
            // No receivers is fine: tokens check the stored reason before waiting.
            let _ = self.shutdown_tx.send(reason);
            true
        } else {
            tracing::warn!("Shutdown already initiated, ignoring signal");
            false
        }
    }

    /// Wait indefinitely for shutdown signal (used in main application loop)
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.shutdown_token().wait_for_shutdown().await
    }

    /// Create a shutdown token that can be used to cancel operations
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.subscribe(),
            reason: self.reason.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> std::io::Result<()> {
    // Only Ctrl+C exists off Unix
    std::future::pending::<()>().await;
    Ok(())
}

/// A token that can be used to check for shutdown signals
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            reason: self.reason.clone(),
        }
    }
}

impl ShutdownToken {
    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Resolve once shutdown has been initiated, including when that happened
    /// before the token was created.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        if let Some(reason) = self.reason.get() {
            return *reason;
        }

        // The reason is stored before it is broadcast, so a lagged or closed
        // channel still finds it.
        match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => self.reason.get().copied().unwrap_or(ShutdownReason::Requested),
        }
    }
}
