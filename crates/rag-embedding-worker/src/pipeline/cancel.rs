use std::sync::Arc;

use tokio::sync::watch;

/// Owning, cloneable handle to a cancellation signal: one per ingestion
/// session, shared with every worker that needs to trip it (e.g. the
/// upsert pool on a dimension mismatch) as well as the caller who wants
/// to request a graceful stop.
#[derive(Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

/// A read-only, cheaply cloneable handle workers hold to poll or await
/// cancellation without being able to trigger it themselves.
#[derive(Clone)]
pub struct CancellationListener {
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn listener(&self) -> CancellationListener {
        CancellationListener {
            receiver: self.receiver.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Signals cancellation. A second call is a no-op: the pipeline
    /// already transitioned to hard-abort behavior on the first signal,
    /// so this just re-asserts the same state.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationListener {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_observes_cancel() {
        let token = CancellationToken::new();
        let listener = token.listener();
        assert!(!listener.is_cancelled());
        token.cancel();
        assert!(listener.is_cancelled());
        listener.cancelled().await;
    }

    #[tokio::test]
    async fn cloned_token_shares_signal() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
