//! Pause gate shared by a loop and whoever pauses it.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Pause flag that loops wait on at their suspension points.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
        }
    }

    /// Close the gate. Returns `false` if it was already closed.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Open the gate and wake every waiter. Returns `false` if it was already open.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    /// Whether the gate is closed.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            open = rx.wait_for(|paused| !*paused) => open.is_ok(),
        }
    }

    /// Resolve once the gate is closed.
    pub async fn paused(&self) {
        let mut rx = self.paused.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail
        let _ = rx.wait_for(|paused| *paused).await;
    }
}
