//! Write-once, read-many result slots.
//!
//! The coordinator keeps a [`CompletionSlot`] per request and hands the caller a
//! [`CompletionHandle`]. Exactly one outcome is ever stored. A slot dropped without an outcome
//! resolves itself as [`CoordinatorError::Cancelled`] so no handle waits forever.

use crate::error::CoordinatorError;
use crate::scheduler::RequestId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome delivered through a completion handle.
pub type Outcome<T, E> = Result<T, CoordinatorError<E>>;

pub(crate) struct CompletionSlot<T, E> {
    tx: watch::Sender<Option<Outcome<T, E>>>,
    cancelled: Arc<AtomicBool>,
}

impl<T, E> fmt::Debug for CompletionSlot<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("resolved", &self.is_resolved())
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .finish()
    }
}

impl<T, E> CompletionSlot<T, E> {
    pub(crate) fn new(id: RequestId) -> (Arc<Self>, CompletionHandle<T, E>) {
        let (tx, rx) = watch::channel(None);
        let cancelled = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(Self { tx, cancelled: cancelled.clone() });
        (slot, CompletionHandle { id, rx, cancelled })
    }

    /// Store `outcome` unless one is already there. Returns `true` if this call stored it.
    pub(crate) fn resolve(&self, outcome: Outcome<T, E>) -> bool {
        self.tx.send_if_modified(move |current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Flag the request as cancelled and resolve it. Returns `false` if it already had an outcome.
    pub(crate) fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        self.resolve(Err(CoordinatorError::Cancelled))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Every handle has been dropped.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T, E> Drop for CompletionSlot<T, E> {
    fn drop(&mut self) {
        self.resolve(Err(CoordinatorError::Cancelled));
    }
}

/// Caller-side view of a submitted request.
///
/// Cloning is cheap; every clone observes the same outcome.
pub struct CompletionHandle<T, E> {
    id: RequestId,
    rx: watch::Receiver<Option<Outcome<T, E>>>,
    cancelled: Arc<AtomicBool>,
}

impl<T, E> Clone for CompletionHandle<T, E> {
    fn clone(&self) -> Self {
        Self { id: self.id, rx: self.rx.clone(), cancelled: self.cancelled.clone() }
    }
}

impl<T, E> fmt::Debug for CompletionHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T, E> CompletionHandle<T, E> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Withdraw interest. A queued request is skipped without consuming quota and resolves as
    /// `Cancelled` the next time its group is drained; use `Coordinator::cancel` to resolve it
    /// immediately.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Clone, E: Clone> CompletionHandle<T, E> {
    /// The outcome if one has been stored.
    pub fn try_result(&self) -> Option<Outcome<T, E>> {
        (*self.rx.borrow()).clone()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Outcome<T, E> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(CoordinatorError::Cancelled))
    }
}
