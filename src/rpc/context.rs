use std::sync::Arc;
use tokio::sync::watch;

/// Cancelable context handed to every handler.
///
/// Derived from the connection's root context: when the connection reaches
/// end-of-stream every outstanding context is canceled.
#[derive(Debug, Clone)]
pub struct CallContext {
    peer: Arc<str>,
    cancelled: watch::Receiver<bool>,
}

impl CallContext {
    /// Remote address of the connection the call arrived on.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the context is canceled (or its source is gone).
    pub async fn cancelled(&mut self) {
        let _ = self.cancelled.wait_for(|cancelled| *cancelled).await;
    }
}

/// Root of a connection's contexts; cancels all of them at once.
#[derive(Debug)]
pub struct CancelSource {
    peer: Arc<str>,
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new(peer: &str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            peer: Arc::from(peer),
            tx,
        }
    }

    pub fn context(&self) -> CallContext {
        CallContext {
            peer: Arc::clone(&self.peer),
            cancelled: self.tx.subscribe(),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_reaches_every_context() {
        let source = CancelSource::new("127.0.0.1:5000");
        let first = source.context();
        let mut second = source.context();
        assert!(!first.is_cancelled());
        assert_eq!(second.peer(), "127.0.0.1:5000");

        let waiter = tokio::spawn(async move {
            second.cancelled().await;
        });
        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(first.is_cancelled());
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn test_context_created_after_cancel_is_cancelled() {
        let source = CancelSource::new("peer");
        source.cancel();
        assert!(source.context().is_cancelled());
    }
}
