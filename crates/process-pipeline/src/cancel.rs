//! Caller-driven cancellation for running subprocesses
//!
//! [`cancellation`] returns a handle/token pair. The token is attached to a
//! [`Command`](crate::Command); firing the handle sends SIGTERM to the process
//! and settles it as a failure whose cause embeds the supplied reason.
//! Cancelling after the process has settled is a no-op.

use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender, bounded};

/// Create a connected cancellation handle/token pair.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded::<()>(1);
    let reason = Arc::new(Mutex::new(None));
    (
        CancelHandle {
            tx,
            reason: Arc::clone(&reason),
        },
        CancelToken { rx, reason },
    )
}

/// The caller-held side of a cancellation pair.
///
/// Dropping the handle without calling [`cancel`](CancelHandle::cancel) means
/// the subprocess is never cancelled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Sender<()>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelHandle {
    /// Request cancellation, recording the reason that will appear in the
    /// resulting error's `cause`.
    pub fn cancel(&self, reason: impl Into<String>) {
        *self.reason.lock().unwrap() = Some(reason.into());
        self.tx.close();
    }
}

/// The subprocess-held side of a cancellation pair, attached via
/// [`Command::cancel_token`](crate::Command::cancel_token).
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelToken {
    /// Resolve with the cancellation reason once fired, or `None` if the
    /// handle was dropped without cancelling.
    pub(crate) async fn fired(self) -> Option<String> {
        // The channel never carries a message; it only closes.
        let _ = self.rx.recv().await;
        self.reason.lock().unwrap().clone()
    }
}
