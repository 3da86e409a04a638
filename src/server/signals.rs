//! Signal handling for graceful shutdown.
//!
//! SIGTERM and SIGINT (Ctrl-C) request shutdown. Every long-running task
//! holds a [`ShutdownSignal`] and stops when it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

/// Signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM, or a shutdown requested from code.
    Terminate,
    /// SIGINT / Ctrl-C.
    Interrupt,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Broadcasts shutdown to every subscribed task.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown: Arc<AtomicBool>,
    signal_tx: broadcast::Sender<Signal>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            signal_tx,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown without an OS signal.
    pub fn request_shutdown(&self) {
        self.handle_signal(Signal::Terminate);
    }

    fn handle_signal(&self, signal: Signal) {
        info!("Received {}, shutting down", signal);
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.signal_tx.send(signal);
    }

    /// Wait for SIGTERM or SIGINT, then broadcast shutdown.
    #[cfg(unix)]
    pub async fn listen(&self) {
        use futures::StreamExt;
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook_tokio::Signals;

        let mut signals = match Signals::new([SIGTERM, SIGINT]) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        if let Some(signal) = signals.next().await {
            let sig = if signal == SIGINT {
                Signal::Interrupt
            } else {
                Signal::Terminate
            };
            self.handle_signal(sig);
        }
    }

    #[cfg(not(unix))]
    pub async fn listen(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => self.handle_signal(Signal::Interrupt),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    }

    /// A handle that resolves once shutdown is requested.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown: Arc::clone(&self.shutdown),
            rx: self.signal_tx.subscribe(),
        }
    }

    /// Spawn [`listen`](Self::listen) in the background.
    pub fn install(&self) {
        let handler = self.clone();
        tokio::spawn(async move {
            handler.listen().await;
        });
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes when shutdown is signaled.
pub struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
    rx: broadcast::Receiver<Signal>,
}

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        loop {
            match self.rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            shutdown: Arc::clone(&self.shutdown),
            rx: self.rx.resubscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_display() {
        assert_eq!(format!("{}", Signal::Terminate), "SIGTERM");
        assert_eq!(format!("{}", Signal::Interrupt), "SIGINT");
    }

    #[test]
    fn test_request_shutdown() {
        let handler = SignalHandler::new();
        assert!(!handler.is_shutdown());
        handler.request_shutdown();
        assert!(handler.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let handler = SignalHandler::new();
        let mut shutdown = handler.shutdown_signal();
        let mut cloned = shutdown.clone();

        let h = handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.request_shutdown();
        });

        tokio::time::timeout(Duration::from_millis(500), shutdown.wait())
            .await
            .expect("shutdown should complete");
        tokio::time::timeout(Duration::from_millis(500), cloned.wait())
            .await
            .expect("cloned signal should complete");
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let handler = SignalHandler::new();
        handler.request_shutdown();
        let mut late = handler.shutdown_signal();
        tokio::time::timeout(Duration::from_millis(100), late.wait())
            .await
            .expect("already shut down");
    }
}
