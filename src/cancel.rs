//! Cancellation tokens
//!
//! Each session agent owns a `CancelHandle`; everything running on its
//! behalf (provider calls, queue waits, subprocesses) holds a `CancelSignal`
//! clone and unwinds when it fires. Built on a watch channel so a signal
//! observed late still reads as cancelled.

use tokio::sync::watch;

/// Fires the cancellation. Dropping the handle also cancels.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Clonable observer side of the token.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires (immediately if it already has).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // A closed channel means the handle dropped, which is a cancel.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_observes_cancel() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await; // returns immediately
    }

    #[tokio::test]
    async fn dropping_handle_cancels() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}
