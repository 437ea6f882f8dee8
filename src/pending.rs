//! Callers waiting for a transport handle.
//!
//! Each waiter is a one-shot channel. Resolution drains the registry, so a
//! waiter can be fulfilled at most once; cancellation removes its sender, so
//! an abandoned waiter is never fulfilled at all.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::FetchError;
use crate::transport::TransportHandle;

pub(crate) type Delivery = Result<TransportHandle, FetchError>;

/// Identity of one registered waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// Set of pending waiters. Not synchronized itself: it lives inside the
/// connection manager's critical section.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    next_id: u64,
    waiters: HashMap<WaiterId, oneshot::Sender<Delivery>>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Register a waiter; the receiver resolves when the registry does.
    pub(crate) fn add(&mut self) -> (WaiterId, oneshot::Receiver<Delivery>) {
        self.next_id += 1;
        let id = WaiterId(self.next_id);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        (id, rx)
    }

    /// Cancel a waiter. `false` if it was already resolved or removed.
    pub fn remove(&mut self, id: WaiterId) -> bool {
        self.waiters.remove(&id).is_some()
    }

    /// Deliver `handle` to every waiter and empty the registry.
    pub fn resolve_all(&mut self, handle: &TransportHandle) -> usize {
        self.deliver(|| Ok(handle.clone()))
    }

    /// Deliver `error` to every waiter and empty the registry.
    pub fn fail_all(&mut self, error: FetchError) -> usize {
        self.deliver(|| Err(error.clone()))
    }

    fn deliver(&mut self, mut outcome: impl FnMut() -> Delivery) -> usize {
        let mut delivered = 0;
        for (id, tx) in self.waiters.drain() {
            // A receiver dropped without cancelling is mid-drop and about to
            // cancel; nothing to deliver to.
            if tx.send(outcome()).is_ok() {
                delivered += 1;
            } else {
                debug!(waiter = ?id, "waiter went away before resolution");
            }
        }
        delivered
    }
}

/// Implemented by whatever owns the registry, so a dropped [`PendingHandle`]
/// can cancel itself.
pub(crate) trait WaiterSet: Send + Sync {
    fn cancel(&self, id: WaiterId) -> bool;
}

enum Slot {
    Ready(Delivery),
    Waiting {
        id: WaiterId,
        rx: oneshot::Receiver<Delivery>,
        owner: Weak<dyn WaiterSet>,
    },
    Done,
}

/// Future of a transport handle returned by
/// [`ConnectionManager::request_handle`](crate::ConnectionManager::request_handle).
///
/// Resolves exactly once. Dropping it (or calling [`cancel`](Self::cancel))
/// before it resolves removes the waiter from the registry.
#[must_use = "a PendingHandle does nothing unless awaited"]
pub struct PendingHandle {
    slot: Slot,
}

impl PendingHandle {
    pub(crate) fn ready(delivery: Delivery) -> Self {
        Self {
            slot: Slot::Ready(delivery),
        }
    }

    pub(crate) fn waiting(
        id: WaiterId,
        rx: oneshot::Receiver<Delivery>,
        owner: Weak<dyn WaiterSet>,
    ) -> Self {
        Self {
            slot: Slot::Waiting { id, rx, owner },
        }
    }

    /// The registry entry backing this future, if it is still waiting.
    pub fn waiter_id(&self) -> Option<WaiterId> {
        match &self.slot {
            Slot::Waiting { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Abandon the wait. Other waiters are unaffected.
    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if let Slot::Waiting { id, owner, .. } = std::mem::replace(&mut self.slot, Slot::Done) {
            if let Some(owner) = owner.upgrade() {
                if owner.cancel(id) {
                    debug!(waiter = ?id, "handle request cancelled");
                }
            }
        }
    }
}

impl Future for PendingHandle {
    type Output = Delivery;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Slot::Waiting { rx, .. } = &mut this.slot {
            let received = match Pin::new(rx).poll(cx) {
                Poll::Ready(received) => received,
                Poll::Pending => return Poll::Pending,
            };
            this.slot = Slot::Done;
            // Sender dropped without delivering: the owner is gone.
            return Poll::Ready(received.unwrap_or(Err(FetchError::ManagerGone)));
        }
        match std::mem::replace(&mut this.slot, Slot::Done) {
            Slot::Ready(delivery) => Poll::Ready(delivery),
            _ => panic!("PendingHandle polled after completion"),
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.abandon();
    }
}
