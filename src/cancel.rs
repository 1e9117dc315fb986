// Cancellation Token
//
// Long-running operations (blob downloads, reassembly, OS install) take a
// `CancelToken` and check it at every suspension point. Cancelling is
// idempotent and visible to every clone of the token.

use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation signal shared between a caller and the tasks it spawns.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of this token, so wait_for only
        // errors if every clone is gone, which cannot happen while we hold one.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
