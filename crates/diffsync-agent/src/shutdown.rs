//! Cooperative shutdown
//!
//! A [`ShutdownHandle`] is cloned into every loop and every suspending call.
//! Loops check it between units of work; sleeps and transfers race against
//! [`ShutdownHandle::cancelled`] so a termination request never waits for a
//! full cadence interval.
//!
//! ## Usage
//!
//! ```ignore
//! let shutdown = ShutdownHandle::new();
//! shutdown.listen_for_signals();
//!
//! while !shutdown.is_shutdown() {
//!     do_one_batch().await?;
//!     if !shutdown.sleep(Duration::from_secs(60)).await {
//!         break;
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// What triggered the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
    /// Manual shutdown requested
    Manual,
    /// The apply tool exited with the cooperative-shutdown code
    ToolRequested,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
            Self::Manual => write!(f, "manual"),
            Self::ToolRequested => write!(f, "apply tool request"),
        }
    }
}

/// Handle for triggering and monitoring shutdown
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<Option<ShutdownSignal>>>,
    receiver: watch::Receiver<Option<ShutdownSignal>>,
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("signal", &*self.receiver.borrow())
            .finish()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Trigger a manual shutdown
    pub fn shutdown(&self) {
        self.trigger(ShutdownSignal::Manual);
    }

    /// Records `signal` unless a shutdown is already in progress.
    pub fn trigger(&self, signal: ShutdownSignal) {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.receiver.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Completes once shutdown has been triggered.
    pub async fn cancelled(&self) -> ShutdownSignal {
        let mut receiver = self.receiver.clone();
        let signal = match receiver.wait_for(Option::is_some).await {
            Ok(signal) => *signal,
            // The sender lives in this handle, so this only happens on drop.
            Err(_) => None,
        };
        signal.unwrap_or(ShutdownSignal::Manual)
    }

    /// Sleeps for `duration`. Returns `false` if shutdown interrupted it.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }

    /// Spawns a task that triggers this handle on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            let signal = tokio::select! {
                signal = shutdown_signal() => signal,
                _ = handle.cancelled() => return,
            };
            info!(signal = %signal, "Received shutdown signal, finishing current step");
            handle.trigger(signal);
        });
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a future that completes when a shutdown signal is received
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        ShutdownSignal::SigInt
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
        ShutdownSignal::SigTerm
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
