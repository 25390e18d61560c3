//! Process-wide admission gate for new live connections.
//!
//! While the gate is blocked no websocket upgrade proceeds past
//! [`ConnectionGate::await_open`]. Sessions that are already serving are not
//! affected; the gate only controls admission, e.g. while the application is
//! being reloaded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Shared boolean gate, initialized open. Cloning shares the same gate.
#[derive(Clone)]
pub struct ConnectionGate {
    open: Arc<watch::Sender<bool>>,
}

impl ConnectionGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { open: Arc::new(tx) }
    }

    /// Stop admitting new connections until [`unblock`](Self::unblock).
    pub fn block(&self) {
        if self.open.send_replace(false) {
            info!("Connection gate closed, new sessions are paused");
        }
    }

    /// Reopen the gate and wake every waiter.
    pub fn unblock(&self) {
        if !self.open.send_replace(true) {
            info!("Connection gate reopened");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Suspend until the gate is open. Returns immediately if it already is.
    pub async fn await_open(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Like [`await_open`](Self::await_open) but gives up after `limit`.
    /// Returns whether the gate is open.
    pub async fn await_open_for(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.await_open()).await.is_ok()
    }

    /// Close the gate for the lifetime of the returned guard.
    pub fn pause(&self) -> GatePause {
        self.block();
        GatePause { gate: self.clone() }
    }
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Reopens the gate when dropped.
pub struct GatePause {
    gate: ConnectionGate,
}

impl Drop for GatePause {
    fn drop(&mut self) {
        self.gate.unblock();
    }
}
