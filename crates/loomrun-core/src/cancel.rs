use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal threaded through an invocation.
/// `Arc<Notify>`-backed rather than pulling in `tokio-util`'s
/// `CancellationToken` — an equivalent is already expressible with the
/// `tokio::sync` primitives the rest of the workspace depends on.
#[derive(Clone)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }

    /// A child token that is cancelled whenever `self` is, but can also be
    /// cancelled independently (used for `call`/`spawn`, which are
    /// cancelled with their parent). `dispatch` does NOT call this:
    /// it gets a fresh, unlinked `CancelToken` so it survives parent
    /// completion.
    pub fn linked_child(&self) -> CancelToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let parent = self.clone();
        let child_for_task = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_for_task.cancel();
        });
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_sets_flag() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn linked_child_cancels_when_parent_does() {
        let parent = CancelToken::new();
        let child = parent.linked_child();
        assert!(!child.is_cancelled());
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn linked_child_created_after_cancellation_is_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        let child = parent.linked_child();
        assert!(child.is_cancelled());
    }
}
