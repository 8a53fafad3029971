//! Cooperative cancellation shared between a session owner and its workers.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Cancellation flag plus a broadcast channel so blocked workers wake up
/// immediately instead of noticing the flag on their next poll.
pub struct CancelState {
    cancel_tx: broadcast::Sender<()>,
    cancelled: AtomicBool,
}

impl CancelState {
    pub fn new() -> Self {
        let (cancel_tx, _) = broadcast::channel(1);
        Self {
            cancel_tx,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Subscribe for the wakeup signal. Receivers created after `cancel()`
    /// must still check `is_cancelled()` first.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.cancel_tx.subscribe()
    }
}

impl Default for CancelState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_sets_flag_and_wakes_subscriber() {
        let state = CancelState::new();
        let mut rx = state.subscribe();
        assert!(!state.is_cancelled());
        state.cancel();
        assert!(state.is_cancelled());
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let state = CancelState::new();
        state.cancel();
        state.cancel();
        assert!(state.is_cancelled());
    }
}
