//! Cooperative cancellation.
//!
//! A single [`CancelToken`] is threaded into every provider through the
//! execution context. Providers check it at suspension points; the
//! engine never force-kills a task. Cancellation is level-triggered
//! and one-way: once cancelled, a token stays cancelled.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable, observable cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        // send_replace never fails even with no active receivers.
        self.sender.send_replace(true);
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow() {
                return;
            }
            // The sender lives inside `self`, so `changed` cannot fail
            // while this future is polled.
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
