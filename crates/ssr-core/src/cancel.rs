//! Cancellation primitives (§4.1).
//!
//! Every nontrivial operation in this server exposes three facets: a handle
//! whose completion can be awaited, an idempotent cancel, and a terminal-status
//! query. Cancellation is cooperative — requesting cancel only signals the
//! operation to finish; the awaitable resolves once any resources it acquired
//! have been released.
//!
//! Built on [`tokio_util::sync::CancellationToken`], whose child-token
//! cascade already gives us "cancel the parent cancels every registered
//! child" for free; this module adds the completion bookkeeping the source
//! system layers on top of that.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A cheaply-cloneable cancel button plus a terminal-status query.
///
/// This is the "facet (b)" and "facet (c)" of §4.1: canceling is idempotent
/// and safe from any concurrent caller, and `is_completed` can be polled
/// without consuming anything.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    completed: Arc<AtomicBool>,
}

impl CancelHandle {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Safe to call more than once, from any task.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the operation has reached a terminal state (it may have
    /// completed normally or been cancelled partway through cleanup).
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// A child token suitable for a sub-operation: cancelling `self` cancels
    /// it too, and it can be cancelled independently without affecting
    /// `self`.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }
}

/// A spawned, cancelable operation yielding `T`.
///
/// `Operation::spawn` runs `f` on the Tokio runtime with its own
/// [`CancellationToken`] (optionally a child of a parent). The future is
/// expected to observe the token cooperatively and unwind any resources it
/// opened before returning. The terminal status flips to `completed` the
/// instant the future resolves, strictly before the result value becomes
/// observable to a waiter — satisfying the ordering §4.1 requires.
pub struct Operation<T> {
    handle: CancelHandle,
    result: oneshot::Receiver<T>,
}

impl<T: Send + 'static> Operation<T> {
    /// Spawn `f` as a new cancelable operation, optionally nested under
    /// `parent`'s cancellation.
    pub fn spawn<F, Fut>(parent: Option<&CancellationToken>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let token = match parent {
            Some(p) => p.child_token(),
            None => CancellationToken::new(),
        };
        let handle = CancelHandle::new(token.clone());
        let (tx, rx) = oneshot::channel();
        let completion_handle = handle.clone();

        tokio::spawn(async move {
            let value = f(token).await;
            completion_handle.mark_completed();
            // The receiver may have been dropped (operation abandoned); that's fine.
            let _ = tx.send(value);
        });

        Self {
            handle,
            result: rx,
        }
    }

    /// A cloneable handle that callers can use to cancel or poll status
    /// without owning the operation itself.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Await the operation's result. Returns `None` if the task was dropped
    /// before sending a value (e.g. it panicked).
    pub async fn wait(self) -> Option<T> {
        self.result.await.ok()
    }
}

/// Composes many sub-operations' cancel handles into one: canceling the
/// group cancels every member.
#[derive(Clone, Default)]
pub struct CancelGroup {
    members: Vec<CancellationToken>,
}

impl CancelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child token with this group. Typically obtained via
    /// [`CancelHandle::child_token`] or [`CancellationToken::child_token`].
    pub fn add(&mut self, token: CancellationToken) {
        self.members.push(token);
    }

    /// Cancel every registered member. Idempotent.
    pub fn cancel_all(&self) {
        for token in &self.members {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
