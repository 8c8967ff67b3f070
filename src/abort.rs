//! Abort-signal wiring
//!
//! Connect options may carry an [`AbortSignal`]; when it fires the socket is
//! destroyed. The pairing of a signal to its destroy task is an
//! [`AbortBinding`], removable exactly once (dropping it removes it too).

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Source half of an abort signal.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer half of an abort signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the controller aborts. Resolves immediately if it
    /// already has.
    pub async fn aborted(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // Sender dropped without aborting means the signal can never fire.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// A disposable pairing of an [`AbortSignal`] to a listener task.
#[derive(Debug)]
pub struct AbortBinding {
    task: Option<JoinHandle<()>>,
}

impl AbortBinding {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Detach the listener. Safe to call once; later calls are no-ops.
    pub fn remove(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AbortBinding {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_fires_signal() {
        let controller = AbortController::new();
        let mut signal = controller.signal();
        assert!(!signal.is_aborted());

        controller.abort();
        signal.aborted().await;
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_idempotent() {
        let controller = AbortController::new();
        controller.abort();
        controller.abort();
        assert!(controller.signal().is_aborted());
    }

    #[tokio::test]
    async fn test_binding_remove_twice() {
        let task = tokio::spawn(std::future::pending::<()>());
        let mut binding = AbortBinding::new(task);
        binding.remove();
        binding.remove();
    }
}
