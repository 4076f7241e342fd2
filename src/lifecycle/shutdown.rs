//! Drain signal for the guard's listeners.
//!
//! # Shutdown order
//! ```text
//! SIGINT / SIGTERM
//!     → Shutdown::trigger()
//!     → public listener and admin listener stop accepting, drain in-flight requests
//!     → main closes the shared store
//! ```
//!
//! The store is closed last because admission middleware, the admin API and
//! detached event writes all hold it until their listener has drained.

use tokio::sync::broadcast;

/// One-shot drain signal fanned out to every listener task.
///
/// Subscribe before spawning the task; a receiver created after
/// [`Shutdown::trigger`] never sees the signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Ask every subscribed listener to drain. Safe with no subscribers.
    pub fn trigger(&self) {
        if self.tx.send(()).is_err() {
            tracing::debug!("Shutdown triggered with no listeners subscribed");
        }
    }

    /// Listener tasks still holding a receiver.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
