//! Graceful shutdown handling
//!
//! A cloneable `Shutdown` handle fans a single signal out to every
//! background loop of a node or coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Requested in-process
    Manual,
}

impl ShutdownSignal {
    pub fn reason(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT received",
            ShutdownSignal::Terminate => "SIGTERM received",
            ShutdownSignal::Manual => "manual shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<ShutdownSignal>,
    triggered: Arc<AtomicBool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the signal. Returns false if shutdown was already under way.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Initiating shutdown: {}", signal.reason());
        let _ = self.tx.send(signal);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }
}

/// Per-task receiving end of a `Shutdown`.
#[derive(Debug)]
pub struct ShutdownListener {
    rx: broadcast::Receiver<ShutdownSignal>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered, including before the
    /// listener was created.
    pub async fn recv(&mut self) -> ShutdownSignal {
        if self.triggered.load(Ordering::SeqCst) {
            return self.rx.try_recv().unwrap_or(ShutdownSignal::Manual);
        }
        self.rx.recv().await.unwrap_or(ShutdownSignal::Manual)
    }
}

/// Wait for Ctrl+C or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                _ = terminate.recv() => ShutdownSignal::Terminate,
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> ShutdownSignal {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownSignal::Interrupt
}
