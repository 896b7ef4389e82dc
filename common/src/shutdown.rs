//! Cooperative cancellation shared by threads and async tasks.

use std::time::Duration;

use tokio::sync::watch;

/// The `running` flag for a set of tasks.
///
/// Synchronous loops poll [`Shutdown::is_running`]; async loops await
/// [`Shutdown::cancelled`] inside `select!`. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    // ---
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    // ---
    pub fn new() -> Self {
        // ---
        let (tx, rx) = watch::channel(true);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Clears the running flag. Idempotent.
    pub fn trigger(&self) {
        // ---
        self.tx.send_if_modified(|running| std::mem::replace(running, false));
    }

    pub fn is_running(&self) -> bool {
        // ---
        *self.rx.borrow()
    }

    /// Resolves once the flag has been cleared.
    pub async fn cancelled(&self) {
        // ---
        let mut rx = self.rx.clone();
        // An error means every sender is gone, which also ends the run.
        let _ = rx.wait_for(|running| !running).await;
    }

    /// Sleeps for `dur` unless cancelled first. Returns false if cancelled.
    pub async fn sleep(&self, dur: Duration) -> bool {
        // ---
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_running(),
            _ = self.cancelled() => false,
        }
    }

    /// A child flag that is cleared together with this one, but can also be
    /// cleared on its own.
    pub fn child(&self) -> Shutdown {
        // ---
        let child = Shutdown::new();
        let parent = self.clone();
        let linked = child.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::select! {
                    _ = parent.cancelled() => linked.trigger(),
                    _ = linked.cancelled() => {}
                }
            });
        }
        child
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        // ---
        Self::new()
    }
}
