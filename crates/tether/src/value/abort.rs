use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, DropGuard};

/// Observes whether an operation was aborted, and why.
#[derive(Clone)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<Option<String>>>,
    /// Cancelled when the controller is dropped.
    orphaned: CancellationToken,
    /// Shared by every clone handed out for a revived signal.
    _observers: Option<Arc<DropGuard>>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            orphaned: CancellationToken::new(),
            _observers: None,
        }
    }

    /// Tie `guard` to this signal's clones; it fires once the last is dropped.
    pub(crate) fn observed_by(mut self, guard: DropGuard) -> Self {
        self._observers = Some(Arc::new(guard));
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().and_then(|reason| reason.as_deref())
    }

    /// Resolves once aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// Resolves once the controller is gone; an unaborted signal then never
    /// aborts.
    pub(crate) async fn orphaned(&self) {
        self.orphaned.cancelled().await
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Owns the right to abort its [`AbortSignal`].
#[derive(Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort once; later calls keep the first reason.
    pub fn abort(&self, reason: Option<String>) {
        // Reason must be visible before anyone wakes on the token.
        let _ = self.signal.reason.set(reason);
        self.signal.token.cancel();
    }
}

impl Drop for AbortController {
    fn drop(&mut self) {
        self.signal.orphaned.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_wakes_waiters() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move {
                signal.aborted().await;
                signal.reason().map(str::to_owned)
            }
        });
        controller.abort(Some("timeout".to_string()));

        assert_eq!(waiter.await.unwrap().as_deref(), Some("timeout"));
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn dropping_the_controller_orphans_the_signal() {
        let controller = AbortController::new();
        let signal = controller.signal();

        drop(controller);
        signal.orphaned().await;
        assert!(!signal.is_aborted());
    }

    #[test]
    fn observers_fire_after_the_last_clone() {
        let controller = AbortController::new();
        let released = CancellationToken::new();
        let signal = controller.signal().observed_by(released.clone().drop_guard());
        let clone = signal.clone();

        drop(signal);
        assert!(!released.is_cancelled());
        drop(clone);
        assert!(released.is_cancelled());
        // The controller's own handle doesn't count.
        assert!(!controller.signal().is_aborted());
    }

    #[test]
    fn first_reason_wins() {
        let controller = AbortController::new();
        controller.abort(Some("first".to_string()));
        controller.abort(Some("second".to_string()));
        assert_eq!(controller.signal().reason(), Some("first"));
    }
}
