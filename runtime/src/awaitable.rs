//! Single-shot completion signal coordinating the dataflow graph.
//!
//! An `Awaitable` starts `Pending` and moves exactly once to one of the
//! three terminal states. Any number of waiters may block on it; they are
//! all woken by the one `fulfill`. A wait also observes the ambient
//! cancellation token so a cancelled run cannot deadlock on a node that
//! will never settle.
//!

use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum AwaitState {
    Pending,
    Resolved,
    Rejected,
    Canceled,
}

#[derive(Debug)]
pub struct Awaitable {
    tx: watch::Sender<AwaitState>,
}

impl Awaitable {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AwaitState::Pending);
        Awaitable { tx }
    }

    pub fn state(&self) -> AwaitState {
        *self.tx.borrow()
    }

    /// Transition from `Pending` to a terminal state, waking all waiters.
    /// Returns `false` (and changes nothing) if the awaitable already
    /// settled or `state` is not terminal.
    ///
    pub fn fulfill(&self, state: AwaitState) -> bool {
        if state == AwaitState::Pending {
            return false;
        }
        self.tx.send_if_modified(|current| {
            if *current == AwaitState::Pending {
                *current = state;
                true
            } else {
                false
            }
        })
    }

    /// Block until the awaitable settles or `cancel` fires, whichever comes
    /// first. Returns the terminal state, or `None` if the wait itself was
    /// cancelled while still pending.
    ///
    pub async fn wait(&self, cancel: &CancellationToken) -> Option<AwaitState> {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow();
            if current != AwaitState::Pending {
                return Some(current);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped while pending; treat as cancelled.
                        return None;
                    }
                }
            }
        }
    }

    /// Convenience wrapper: `true` iff the awaitable resolved.
    ///
    pub async fn wait_ok(&self, cancel: &CancellationToken) -> bool {
        matches!(self.wait(cancel).await, Some(AwaitState::Resolved))
    }
}

impl Default for Awaitable {
    fn default() -> Self {
        Awaitable::new()
    }
}
