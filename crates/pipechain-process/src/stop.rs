//! Single-slot stop signal

use tokio::sync::mpsc;

/// Create a connected stop handle and signal
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = mpsc::channel(1);
    (StopHandle { tx }, StopSignal { rx })
}

/// Sending side of a stop request
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    /// Request a stop.
    ///
    /// A request stays pending until the waiting side observes it. Returns
    /// `false` if a request was already pending or the receiver is gone.
    pub fn stop(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Receiving side of a stop request
#[derive(Debug)]
pub struct StopSignal {
    rx: mpsc::Receiver<()>,
}

impl StopSignal {
    /// Resolve once a stop is requested. Cancel safe.
    ///
    /// Dropping every handle is not a stop; in that case this never resolves.
    pub async fn requested(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Consume a pending stop request without waiting
    pub fn try_requested(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pending_stop_survives_until_observed() {
        let (handle, mut signal) = stop_channel();
        assert!(handle.stop());
        assert!(!handle.stop());

        tokio::time::timeout(Duration::from_secs(1), signal.requested())
            .await
            .unwrap();
        assert!(!signal.try_requested());
    }

    #[tokio::test]
    async fn test_dropped_handle_is_not_a_stop() {
        let (handle, mut signal) = stop_channel();
        drop(handle);

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.requested()).await;
        assert!(waited.is_err());
    }
}
