//! Connection manager.
//!
//! Owns the lifecycle of a single transport handle:
//!
//! ```text
//!                request_handle / connect
//!   Disconnected ───────────────────────────► Connecting
//!        ▲  ▲                                   │    │
//!        │  │ connect_failed / release          │    │ connected(H)
//!        │  └───────────────────────────────────┘    ▼
//!        │        disconnected / release          Connected(H)
//!        └────────────────────────────────────────────┤
//!                                                     │ H dies unexpectedly
//!                              Connecting ◄───────────┘ (resuscitation)
//! ```
//!
//! Every transition happens under one lock, together with the pending-waiter
//! registry, so no caller can observe a half-applied transition.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::pending::{PendingHandle, PendingRequestRegistry, WaiterId, WaiterSet};
use crate::proxy::{create_proxy, InterfaceProxy};
use crate::transport::{DeathWatch, HandleId, Transport, TransportHandle};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters, captured once and reused for every reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTarget {
    name: String,
    endpoint: PathBuf,
}

impl BindTarget {
    pub fn new(name: impl Into<String>, endpoint: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.endpoint.display())
    }
}

/// Receiver of transport callbacks for one manager.
pub(crate) trait EventSink: Send + Sync {
    fn on_connected(&self, attempt: u64, handle: TransportHandle);
    fn on_disconnected(&self, attempt: u64);
    fn on_connect_failed(&self, attempt: u64, reason: String);
}

/// Callback sink handed to [`Transport::connect`] for one attempt.
///
/// Reports from an attempt that has since been superseded (released, or
/// replaced by a newer attempt) are ignored.
#[derive(Clone)]
pub struct ConnectionEvents {
    sink: Weak<dyn EventSink>,
    attempt: u64,
}

impl ConnectionEvents {
    pub(crate) fn new(sink: Weak<dyn EventSink>, attempt: u64) -> Self {
        Self { sink, attempt }
    }

    /// Attempt number this sink reports for.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The connection is established.
    pub fn connected(&self, handle: TransportHandle) {
        match self.sink.upgrade() {
            Some(sink) => sink.on_connected(self.attempt, handle),
            None => {
                debug!(handle = %handle.id(), "connection manager gone; dropping new handle");
                handle.invalidate();
            }
        }
    }

    /// The connection ended gracefully (or the attempt ended without one).
    pub fn disconnected(&self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_disconnected(self.attempt);
        }
    }

    /// The attempt failed.
    pub fn connect_failed(&self, reason: impl Into<String>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_connect_failed(self.attempt, reason.into());
        }
    }
}

impl fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("attempt", &self.attempt)
            .finish()
    }
}

enum Slot {
    Disconnected,
    Connecting,
    Connected {
        handle: TransportHandle,
        watch: DeathWatch,
    },
}

struct ManagerState {
    slot: Slot,
    /// Latest attempt number; events carrying any other number are stale.
    attempt: u64,
    connects_initiated: u64,
    waiters: PendingRequestRegistry,
}

impl ManagerState {
    fn connection_state(&self) -> ConnectionState {
        match self.slot {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting => ConnectionState::Connecting,
            Slot::Connected { .. } => ConnectionState::Connected,
        }
    }
}

struct Shared<T: Transport> {
    target: BindTarget,
    transport: T,
    state: Mutex<ManagerState>,
    weak_self: Weak<Shared<T>>,
}

impl<T: Transport> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to Connecting and start a new attempt. Caller holds the lock.
    fn begin_connect(&self, state: &mut ManagerState) {
        state.attempt += 1;
        state.connects_initiated += 1;
        state.slot = Slot::Connecting;
        info!(target_name = self.target.name(), attempt = state.attempt, "connecting");

        let sink: Weak<dyn EventSink> = self.weak_self.clone();
        self.transport
            .connect(&self.target, ConnectionEvents::new(sink, state.attempt));
    }

    fn on_unexpected_death(&self, id: HandleId) {
        let mut state = self.lock();
        match &state.slot {
            Slot::Connected { handle, .. } if handle.id() == id => {}
            _ => {
                debug!(handle = %id, state = %state.connection_state(), "ignoring death of a handle that is not current");
                return;
            }
        }

        warn!(target_name = self.target.name(), handle = %id, "transport died unexpectedly; reconnecting");
        // The fired watch is spent; dropping it is all that is left to do.
        state.slot = Slot::Disconnected;
        self.begin_connect(&mut state);
    }

    fn release(&self) -> bool {
        let mut state = self.lock();
        match std::mem::replace(&mut state.slot, Slot::Disconnected) {
            Slot::Disconnected => false,
            Slot::Connecting => {
                // Supersede the attempt so its late callbacks are ignored.
                state.attempt += 1;
                self.transport.disconnect(&self.target);
                let abandoned = state
                    .waiters
                    .fail_all(FetchError::Released(self.target.to_string()));
                info!(target_name = self.target.name(), abandoned, "released while connecting");
                true
            }
            Slot::Connected { handle, watch } => {
                // Disarm first so the teardown below cannot look like a death.
                watch.disarm();
                self.transport.disconnect(&self.target);
                handle.invalidate();
                state.attempt += 1;
                info!(target_name = self.target.name(), handle = %handle.id(), "released");
                true
            }
        }
    }
}

impl<T: Transport> EventSink for Shared<T> {
    fn on_connected(&self, attempt: u64, handle: TransportHandle) {
        let mut state = self.lock();
        if attempt != state.attempt || !matches!(state.slot, Slot::Connecting) {
            drop(state);
            debug!(attempt, handle = %handle.id(), "connected event from a superseded attempt");
            handle.invalidate();
            return;
        }

        let weak = self.weak_self.clone();
        let watch = handle.link_to_death(move |id| {
            if let Some(shared) = weak.upgrade() {
                shared.on_unexpected_death(id);
            }
        });

        match watch {
            Ok(watch) => {
                state.slot = Slot::Connected {
                    handle: handle.clone(),
                    watch,
                };
                let resolved = state.waiters.resolve_all(&handle);
                info!(
                    target_name = self.target.name(),
                    handle = %handle.id(),
                    resolved,
                    "connected"
                );
            }
            Err(err) => {
                // Dead on arrival counts as an unexpected death: waiters keep
                // waiting while the connection is re-established.
                warn!(handle = %handle.id(), error = %err, "handle died before it could be watched; reconnecting");
                state.slot = Slot::Disconnected;
                self.begin_connect(&mut state);
            }
        }
    }

    fn on_disconnected(&self, attempt: u64) {
        let mut state = self.lock();
        if attempt != state.attempt {
            debug!(attempt, "disconnected event from a superseded attempt");
            return;
        }
        match std::mem::replace(&mut state.slot, Slot::Disconnected) {
            Slot::Disconnected => {}
            Slot::Connecting => {
                let failed = state.waiters.fail_all(FetchError::ConnectFailed {
                    target: self.target.to_string(),
                    reason: "transport disconnected before the connection was established"
                        .to_string(),
                });
                warn!(target_name = self.target.name(), failed, "disconnected while connecting");
            }
            Slot::Connected { handle, watch } => {
                watch.disarm();
                handle.invalidate();
                info!(target_name = self.target.name(), handle = %handle.id(), "disconnected");
            }
        }
    }

    fn on_connect_failed(&self, attempt: u64, reason: String) {
        let mut state = self.lock();
        if attempt != state.attempt || !matches!(state.slot, Slot::Connecting) {
            debug!(attempt, "connect failure from a superseded attempt");
            return;
        }
        state.slot = Slot::Disconnected;
        let failed = state.waiters.fail_all(FetchError::ConnectFailed {
            target: self.target.to_string(),
            reason: reason.clone(),
        });
        warn!(target_name = self.target.name(), %reason, failed, "connect failed");
    }
}

impl<T: Transport> WaiterSet for Shared<T> {
    fn cancel(&self, id: WaiterId) -> bool {
        self.lock().waiters.remove(id)
    }
}

/// Owns one transport handle on behalf of any number of callers.
///
/// Dropping the manager releases the connection.
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(transport, BindTarget::new("calculator", socket));
/// let calculator: CalculatorProxy = manager.fetch().await?;
/// assert_eq!(calculator.plus(10, 20).await?, 30);
/// ```
pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, target: BindTarget) -> Self {
        let shared = Arc::new_cyclic(|weak_self| Shared {
            target,
            transport,
            state: Mutex::new(ManagerState {
                slot: Slot::Disconnected,
                attempt: 0,
                connects_initiated: 0,
                waiters: PendingRequestRegistry::new(),
            }),
            weak_self: weak_self.clone(),
        });
        Self { shared }
    }

    pub fn target(&self) -> &BindTarget {
        &self.shared.target
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().connection_state()
    }

    /// The current handle, if connected.
    pub fn current_handle(&self) -> Option<TransportHandle> {
        match &self.shared.lock().slot {
            Slot::Connected { handle, .. } => Some(handle.clone()),
            _ => None,
        }
    }

    /// Number of callers currently waiting for a handle.
    pub fn pending_waiters(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    /// Number of connect attempts started so far, reconnects included.
    pub fn connects_initiated(&self) -> u64 {
        self.shared.lock().connects_initiated
    }

    /// Start connecting without waiting for the result. No-op unless
    /// disconnected.
    pub fn connect(&self) {
        let mut state = self.shared.lock();
        if matches!(state.slot, Slot::Disconnected) {
            self.shared.begin_connect(&mut state);
        }
    }

    /// Acquire a usable handle.
    ///
    /// Resolves immediately when connected. Otherwise the caller joins the
    /// waiters of the current attempt, starting one only if none is in
    /// flight.
    pub fn request_handle(&self) -> PendingHandle {
        let mut state = self.shared.lock();
        match &state.slot {
            Slot::Connected { handle, .. } if handle.is_alive() => {
                return PendingHandle::ready(Ok(handle.clone()));
            }
            Slot::Connected { handle, .. } => {
                // Died, but the death callback has not run yet.
                warn!(handle = %handle.id(), "current handle is dead; reconnecting");
                state.slot = Slot::Disconnected;
                self.shared.begin_connect(&mut state);
            }
            Slot::Disconnected => self.shared.begin_connect(&mut state),
            Slot::Connecting => debug!("connect already in flight; queueing request"),
        }

        let (id, rx) = state.waiters.add();
        let owner: Weak<dyn WaiterSet> = Arc::downgrade(&self.shared) as Weak<dyn WaiterSet>;
        PendingHandle::waiting(id, rx, owner)
    }

    /// Acquire a handle and build a typed proxy on it.
    pub async fn fetch<P: InterfaceProxy>(&self) -> Result<P, FetchError> {
        let handle = self.request_handle().await?;
        Ok(create_proxy::<P>(&handle))
    }

    /// Tear the connection down. Returns `false` if already disconnected.
    ///
    /// Waiters of an attempt still in flight resolve with
    /// [`FetchError::Released`].
    pub fn release(&self) -> bool {
        self.shared.release()
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl<T: Transport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("target", &self.shared.target)
            .field("state", &state.connection_state())
            .field("attempt", &state.attempt)
            .field("pending_waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Reply, Transaction};
    use crate::error::TransportError;
    use crate::transport::Binder;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    struct NullBinder;

    #[async_trait]
    impl Binder for NullBinder {
        async fn transact(&self, _transaction: Transaction) -> Result<Reply, TransportError> {
            Ok(Reply::Payload(serde_json::Value::Null))
        }
    }

    /// Records calls and keeps each attempt's events for the test to fire.
    #[derive(Default)]
    struct MockTransport {
        calls: StdMutex<Vec<String>>,
        attempts: StdMutex<Vec<ConnectionEvents>>,
    }

    impl MockTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn events(&self, index: usize) -> ConnectionEvents {
            self.attempts.lock().unwrap()[index].clone()
        }

        fn latest(&self) -> ConnectionEvents {
            self.attempts.lock().unwrap().last().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn connect(&self, target: &BindTarget, events: ConnectionEvents) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("connect({}, attempt={})", target.name(), events.attempt()));
            self.attempts.lock().unwrap().push(events);
        }

        fn disconnect(&self, target: &BindTarget) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("disconnect({})", target.name()));
        }
    }

    fn manager() -> ConnectionManager<MockTransport> {
        ConnectionManager::new(
            MockTransport::default(),
            BindTarget::new("calculator", "/tmp/calculator.sock"),
        )
    }

    #[test]
    fn test_starts_disconnected() {
        let manager = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current_handle().is_none());
        assert!(manager.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn test_request_while_disconnected_connects_once() {
        let manager = manager();

        let first = manager.request_handle();
        let second = manager.request_handle();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.pending_waiters(), 2);
        assert_eq!(
            manager.transport().calls(),
            vec!["connect(calculator, attempt=1)".to_string()]
        );

        let handle = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(handle.clone());

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(first.await.unwrap(), handle);
        assert_eq!(second.await.unwrap(), handle);
        assert_eq!(manager.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_request_while_connected_resolves_immediately() {
        let manager = manager();
        manager.connect();
        let handle = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(handle.clone());

        let pending = manager.request_handle();
        assert!(pending.waiter_id().is_none());
        assert_eq!(pending.await.unwrap(), handle);
        assert_eq!(manager.connects_initiated(), 1);
    }

    #[test]
    fn test_connect_is_noop_unless_disconnected() {
        let manager = manager();
        manager.connect();
        manager.connect();
        assert_eq!(manager.connects_initiated(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_unexpected_death_reconnects_without_callers() {
        let manager = manager();
        manager.connect();
        let first = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(first.clone());

        first.notify_death();

        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.connects_initiated(), 2);
        assert_eq!(manager.transport().latest().attempt(), 2);

        let second = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(second.clone());
        assert_eq!(manager.current_handle(), Some(second));
    }

    #[tokio::test]
    async fn test_release_disarms_before_teardown() {
        let manager = manager();
        manager.connect();
        let handle = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(handle.clone());

        assert!(manager.release());
        assert!(!handle.is_alive());
        // A late death report for the released handle changes nothing.
        assert!(!handle.notify_death());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.connects_initiated(), 1);
        assert_eq!(
            manager.transport().calls(),
            vec![
                "connect(calculator, attempt=1)".to_string(),
                "disconnect(calculator)".to_string()
            ]
        );
    }

    #[test]
    fn test_release_when_disconnected_is_noop() {
        let manager = manager();
        assert!(!manager.release());
        assert!(manager.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn test_release_while_connecting_abandons_waiters() {
        let manager = manager();
        let waiter = manager.request_handle();
        let stale_events = manager.transport().latest();

        assert!(manager.release());
        assert_eq!(
            waiter.await.unwrap_err(),
            FetchError::Released("calculator (/tmp/calculator.sock)".to_string())
        );

        // The superseded attempt completing late must not resurrect anything.
        let late = TransportHandle::new(NullBinder);
        stale_events.connected(late.clone());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!late.is_alive());
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_every_waiter() {
        let manager = manager();
        let a = manager.request_handle();
        let b = manager.request_handle();

        manager.transport().latest().connect_failed("connection refused");

        let expected = FetchError::ConnectFailed {
            target: "calculator (/tmp/calculator.sock)".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(a.await.unwrap_err(), expected);
        assert_eq!(b.await.unwrap_err(), expected);
        // No automatic retry after a connect failure.
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.connects_initiated(), 1);
    }

    #[tokio::test]
    async fn test_graceful_disconnect_does_not_reconnect() {
        let manager = manager();
        manager.connect();
        let handle = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(handle.clone());

        manager.transport().latest().disconnected();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!handle.is_alive());
        assert!(!handle.notify_death());
        assert_eq!(manager.connects_initiated(), 1);
    }

    #[tokio::test]
    async fn test_dead_on_arrival_keeps_waiters_waiting() {
        let manager = manager();
        let waiter = manager.request_handle();

        let doa = TransportHandle::new(NullBinder);
        doa.notify_death();
        manager.transport().latest().connected(doa);

        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.pending_waiters(), 1);

        let good = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(good.clone());
        assert_eq!(waiter.await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let manager = manager();
        manager.connect();
        let first_attempt = manager.transport().events(0);
        let handle = TransportHandle::new(NullBinder);
        first_attempt.connected(handle.clone());
        handle.notify_death();

        // Attempt 1 is over; its failure report must not cancel attempt 2.
        first_attempt.connect_failed("late");
        first_attempt.disconnected();
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_others_intact() {
        let manager = manager();
        let keep = manager.request_handle();
        let abandon = manager.request_handle();
        abandon.cancel();
        assert_eq!(manager.pending_waiters(), 1);

        let handle = TransportHandle::new(NullBinder);
        manager.transport().latest().connected(handle.clone());
        assert_eq!(keep.await.unwrap(), handle);
    }

    #[tokio::test]
    async fn test_dropping_manager_releases() {
        let manager = manager();
        manager.connect();
        let events = manager.transport().latest();
        let handle = TransportHandle::new(NullBinder);
        events.connected(handle.clone());

        drop(manager);
        assert!(!handle.is_alive());

        // Callbacks after the manager is gone are harmless.
        let orphan = TransportHandle::new(NullBinder);
        events.connected(orphan.clone());
        assert!(!orphan.is_alive());
    }
}
