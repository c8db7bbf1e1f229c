//! Connection close signal
//! The only cancellation mechanism for a connection's reader and writer

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{CometError, Result};

/// Cloneable handle that closes a connection from any task.
///
/// Timer callbacks, a superseding registration or a failed writer trip it;
/// every pending socket read or write raced against `closed()` then fails,
/// which drives the normal teardown path.
#[derive(Clone)]
pub struct Closer {
    tx: Arc<watch::Sender<bool>>,
}

impl Closer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Idempotent
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Run `fut` unless the connection is closed first
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_closed() {
            return Err(CometError::ConnectionClosed);
        }
        tokio::select! {
            res = fut => res,
            _ = self.closed() => Err(CometError::ConnectionClosed),
        }
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_interrupts_pending_future() {
        let closer = Closer::new();
        let remote = closer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.close();
        });

        let res: Result<()> = closer
            .guard(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(CometError::ConnectionClosed)));
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_guard_passes_through_result() {
        let closer = Closer::new();
        let res = closer.guard(async { Ok(5) }).await;
        assert_eq!(res.unwrap(), 5);
        closer.close();
        closer.close();
        assert!(closer.guard(async { Ok(5) }).await.is_err());
    }
}
