//! Cooperative shutdown signal for the pipeline's background loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Handle for stopping background maintenance loops.
///
/// Loops `select!` on [`ShutdownHandle::cancelled`] next to their ticker,
/// so a signal is observed between ticks and never interrupts one.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    /// Set once the first signal is sent
    triggered: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal shutdown. Returns false if it was already signalled.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sender.send_replace(true);
        true
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Get a receiver for use in select!
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    /// Resolves once shutdown has been signalled.
    pub async fn cancelled(&self) {
        let mut receiver = self.subscribe();
        // Only fails when the sender is gone, which also means shutdown
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}
