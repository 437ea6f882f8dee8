//! Transport handles and death watches.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tracing::debug;

use crate::bridge::{Reply, Transaction};
use crate::error::TransportError;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// The live endpoint behind a [`TransportHandle`].
///
/// Supplied by the transport provider. `close` is called exactly once when
/// the handle is explicitly invalidated.
#[async_trait]
pub trait Binder: Send + Sync + 'static {
    /// Send one transaction and wait for its reply.
    async fn transact(&self, transaction: Transaction) -> Result<Reply, TransportError>;

    /// Release the underlying connection.
    fn close(&self) {}
}

type DeathCallback = Box<dyn FnOnce(HandleId) + Send>;

struct HandleInner {
    id: HandleId,
    alive: AtomicBool,
    binder: Arc<dyn Binder>,
    // Guarded together with `alive` flips so that linking and dying are ordered.
    watches: Mutex<HashMap<u64, DeathCallback>>,
    next_watch: AtomicU64,
}

impl HandleInner {
    fn watches(&self) -> MutexGuard<'_, HashMap<u64, DeathCallback>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip to dead and hand back the armed watches. `None` if already dead.
    fn kill(&self) -> Option<HashMap<u64, DeathCallback>> {
        let mut watches = self.watches();
        if !self.alive.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(std::mem::take(&mut *watches))
    }

    fn die(&self) -> bool {
        let Some(fired) = self.kill() else {
            return false;
        };
        debug!(handle = %self.id, watches = fired.len(), "transport handle died");
        for (_, callback) in fired {
            callback(self.id);
        }
        true
    }
}

/// Capability representing one established connection.
///
/// Cheap to clone; every clone refers to the same connection and observes the
/// same liveness. Once dead, a handle never becomes live again.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<HandleInner>,
}

impl TransportHandle {
    pub fn new(binder: impl Binder) -> Self {
        Self::from_shared(Arc::new(binder))
    }

    pub fn from_shared(binder: Arc<dyn Binder>) -> Self {
        let id = HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(HandleInner {
                id,
                alive: AtomicBool::new(true),
                binder,
                watches: Mutex::new(HashMap::new()),
                next_watch: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Arm `callback` to run once if this handle dies unexpectedly.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DeadObject` if the handle is already dead.
    pub fn link_to_death<F>(&self, callback: F) -> Result<DeathWatch, TransportError>
    where
        F: FnOnce(HandleId) + Send + 'static,
    {
        let mut watches = self.inner.watches();
        if !self.is_alive() {
            return Err(TransportError::DeadObject(self.id()));
        }
        let key = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        watches.insert(key, Box::new(callback));
        Ok(DeathWatch {
            handle: Arc::downgrade(&self.inner),
            key,
            id: self.id(),
        })
    }

    /// Explicit teardown: the handle goes dead and armed watches are dropped
    /// without firing. Returns `false` if it was already dead.
    pub fn invalidate(&self) -> bool {
        let Some(dropped) = self.inner.kill() else {
            return false;
        };
        debug!(handle = %self.id(), unfired = dropped.len(), "transport handle invalidated");
        drop(dropped);
        self.inner.binder.close();
        true
    }

    /// Unexpected termination: the handle goes dead and every armed watch
    /// fires once. Returns `false` if it was already dead.
    pub fn notify_death(&self) -> bool {
        self.inner.die()
    }

    /// A weak reporter that lets the transport signal death without keeping
    /// the handle alive.
    pub fn death_notifier(&self) -> DeathNotifier {
        DeathNotifier {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Send one transaction over this connection.
    pub async fn transact(&self, transaction: Transaction) -> Result<Reply, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::DeadObject(self.id()));
        }
        self.inner.binder.transact(transaction).await
    }
}

impl PartialEq for TransportHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TransportHandle {}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Weak death reporter held by transport internals (e.g. a reader task).
#[derive(Clone)]
pub struct DeathNotifier {
    inner: Weak<HandleInner>,
}

impl DeathNotifier {
    /// Report unexpected termination. `false` if the handle was already dead
    /// or gone.
    pub fn notify(&self) -> bool {
        self.inner.upgrade().map(|inner| inner.die()).unwrap_or(false)
    }
}

/// Registration of a death callback on one handle.
///
/// Dropping the watch leaves the callback armed; `disarm` unlinks it.
#[must_use = "dropping a DeathWatch leaves it armed; call disarm() to unlink it"]
pub struct DeathWatch {
    handle: Weak<HandleInner>,
    key: u64,
    id: HandleId,
}

impl DeathWatch {
    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    /// Unlink the callback. Returns `true` if it was still armed, i.e. it had
    /// not fired and the handle had not been torn down.
    pub fn disarm(self) -> bool {
        match self.handle.upgrade() {
            Some(inner) => inner.watches().remove(&self.key).is_some(),
            None => false,
        }
    }
}

impl fmt::Debug for DeathWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeathWatch")
            .field("handle", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NullBinder {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Binder for NullBinder {
        async fn transact(&self, _transaction: Transaction) -> Result<Reply, TransportError> {
            Ok(Reply::Payload(serde_json::Value::Null))
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle() -> (TransportHandle, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = TransportHandle::new(NullBinder {
            closed: Arc::clone(&closed),
        });
        (handle, closed)
    }

    fn counting_watch(handle: &TransportHandle) -> (DeathWatch, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watch = handle
            .link_to_death(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("handle should be alive");
        (watch, fired)
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let (a, _) = handle();
        let (b, _) = handle();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn test_death_fires_watch_once() {
        let (handle, closed) = handle();
        let (_watch, fired) = counting_watch(&handle);

        assert!(handle.notify_death());
        assert!(!handle.notify_death());
        assert!(!handle.is_alive());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Death is not an explicit teardown.
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalidate_never_fires_watch() {
        let (handle, closed) = handle();
        let (_watch, fired) = counting_watch(&handle);

        assert!(handle.invalidate());
        assert!(!handle.notify_death());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarmed_watch_does_not_fire() {
        let (handle, _) = handle();
        let (watch, fired) = counting_watch(&handle);

        assert!(watch.disarm());
        handle.notify_death();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disarm_after_fire_reports_unarmed() {
        let (handle, _) = handle();
        let (watch, fired) = counting_watch(&handle);

        handle.notify_death();
        assert!(!watch.disarm());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_link_to_dead_handle_fails() {
        let (handle, _) = handle();
        handle.invalidate();

        let result = handle.link_to_death(|_| {});
        assert!(matches!(result, Err(TransportError::DeadObject(id)) if id == handle.id()));
    }

    #[test]
    fn test_death_notifier_is_weak() {
        let (handle, _) = handle();
        let (_watch, fired) = counting_watch(&handle);
        let notifier = handle.death_notifier();

        assert!(notifier.notify());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let (other, _) = self::handle();
        let orphan = other.death_notifier();
        drop(other);
        assert!(!orphan.notify());
    }

    #[tokio::test]
    async fn test_transact_on_dead_handle_fails() {
        let (handle, _) = handle();
        handle.invalidate();

        let result = handle
            .transact(Transaction::new(
                crate::bridge::MethodId::new("a", "b"),
                vec![],
            ))
            .await;
        assert!(matches!(result, Err(TransportError::DeadObject(_))));
    }
}
