//! Close signal for in-flight exchanges.

use tokio::sync::watch;

/// Listens for a connection being closed while one of its requests is in flight.
///
/// The flag only ever goes from `false` to `true`. A dropped sender counts as a
/// close, since nobody is left to deliver the reply to.
pub(crate) struct Shutdown {
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns a new [`Shutdown`] listening on the given [`watch::Receiver`].
    pub(crate) fn new(notify: watch::Receiver<bool>) -> Self {
        Self { notify }
    }

    /// Returns `true` if the close signal has been sent.
    pub(crate) fn is_shutdown(&self) -> bool {
        *self.notify.borrow()
    }

    /// Waits until the close signal is sent, returning at once if it already was.
    pub(crate) async fn recv(&mut self) {
        // Err means the sender is gone
        let _ = self.notify.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn recv_returns_after_signal() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown::new(rx);
        assert!(!shutdown.is_shutdown());

        let waiter = tokio::spawn(async move {
            shutdown.recv().await;
            shutdown.is_shutdown()
        });
        tx.send_replace(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn recv_returns_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown::new(rx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .unwrap();
    }
}
