//! In-process transport.
//!
//! Hosts a [`Dispatcher`] in the same process. Useful for tests and for
//! embedding a service next to its clients; it also lets a test drive every
//! connection event by hand.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::bridge::{Reply, Transaction};
use crate::connection::{BindTarget, ConnectionEvents};
use crate::error::TransportError;
use crate::proxy::Dispatcher;
use crate::transport::{Binder, Transport, TransportHandle};

type TransactionLog = Arc<Mutex<Vec<Transaction>>>;

/// Binder that hands transactions straight to a dispatcher.
pub struct LocalBinder {
    dispatcher: Arc<dyn Dispatcher>,
    log: Option<TransactionLog>,
}

impl LocalBinder {
    pub fn new(dispatcher: impl Dispatcher) -> Self {
        Self::from_shared(Arc::new(dispatcher))
    }

    pub fn from_shared(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            log: None,
        }
    }

    fn with_log(mut self, log: TransactionLog) -> Self {
        self.log = Some(log);
        self
    }
}

#[async_trait]
impl Binder for LocalBinder {
    async fn transact(&self, transaction: Transaction) -> Result<Reply, TransportError> {
        if let Some(log) = &self.log {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(transaction.clone());
        }
        Ok(self.dispatcher.dispatch(transaction).await)
    }
}

/// How connect attempts complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Each attempt completes on a background thread right away.
    Immediate,
    /// Attempts queue until the test completes, fails or disconnects them.
    Manual,
}

#[derive(Default)]
struct LocalState {
    available: bool,
    /// Bumped by `disconnect`; attempts from an older generation are void.
    generation: u64,
    queued: VecDeque<ConnectionEvents>,
    active: Option<(TransportHandle, ConnectionEvents)>,
    last_handle: Option<TransportHandle>,
    connect_count: usize,
    disconnect_count: usize,
}

/// Transport provider backed by an in-process dispatcher.
pub struct LocalTransport {
    dispatcher: Arc<dyn Dispatcher>,
    mode: ConnectMode,
    state: Arc<Mutex<LocalState>>,
    transactions: TransactionLog,
}

impl LocalTransport {
    pub fn new(dispatcher: impl Dispatcher, mode: ConnectMode) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            mode,
            state: Arc::new(Mutex::new(LocalState {
                available: true,
                ..LocalState::default()
            })),
            transactions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn immediate(dispatcher: impl Dispatcher) -> Self {
        Self::new(dispatcher, ConnectMode::Immediate)
    }

    pub fn manual(dispatcher: impl Dispatcher) -> Self {
        Self::new(dispatcher, ConnectMode::Manual)
    }

    pub fn mode(&self) -> ConnectMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_handle(&self) -> TransportHandle {
        let binder = LocalBinder::from_shared(Arc::clone(&self.dispatcher))
            .with_log(Arc::clone(&self.transactions));
        TransportHandle::new(binder)
    }

    /// When unavailable, immediate-mode attempts fail.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnect_count
    }

    /// Attempts waiting for a manual decision.
    pub fn pending_attempts(&self) -> usize {
        self.lock().queued.len()
    }

    /// The handle most recently handed to the manager.
    pub fn last_handle(&self) -> Option<TransportHandle> {
        self.lock().last_handle.clone()
    }

    /// Every transaction that reached the dispatcher, in order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Complete the oldest queued attempt with a fresh handle.
    pub fn complete_next(&self) -> Option<TransportHandle> {
        let (handle, events) = {
            let mut state = self.lock();
            let events = state.queued.pop_front()?;
            let handle = self.new_handle();
            state.active = Some((handle.clone(), events.clone()));
            state.last_handle = Some(handle.clone());
            (handle, events)
        };
        events.connected(handle.clone());
        Some(handle)
    }

    /// Fail the oldest queued attempt.
    pub fn fail_next(&self, reason: &str) -> bool {
        let Some(events) = self.lock().queued.pop_front() else {
            return false;
        };
        events.connect_failed(reason);
        true
    }

    /// End the oldest queued attempt with a disconnect instead of a handle.
    pub fn disconnect_next(&self) -> bool {
        let Some(events) = self.lock().queued.pop_front() else {
            return false;
        };
        events.disconnected();
        true
    }

    /// Gracefully end the active connection, as a host shutting the service
    /// down would.
    pub fn disconnect_active(&self) -> bool {
        let Some((_, events)) = self.lock().active.take() else {
            return false;
        };
        events.disconnected();
        true
    }

    /// Kill the active connection's handle without a graceful disconnect.
    pub fn kill(&self) -> bool {
        let Some((handle, _)) = self.lock().active.take() else {
            return false;
        };
        debug!(handle = %handle.id(), "killing local connection");
        handle.notify_death()
    }
}

impl Transport for LocalTransport {
    fn connect(&self, target: &BindTarget, events: ConnectionEvents) {
        let mut state = self.lock();
        state.connect_count += 1;
        debug!(target_name = target.name(), attempt = events.attempt(), mode = ?self.mode, "local connect");

        match self.mode {
            ConnectMode::Manual => state.queued.push_back(events),
            ConnectMode::Immediate => {
                let available = state.available;
                let generation = state.generation;
                let handle = self.new_handle();
                let shared = Arc::clone(&self.state);
                drop(state);

                // Events must not be delivered from inside `connect`.
                std::thread::spawn(move || {
                    if !available {
                        events.connect_failed("service unavailable");
                        return;
                    }
                    {
                        let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        if state.generation == generation {
                            state.active = Some((handle.clone(), events.clone()));
                            state.last_handle = Some(handle.clone());
                        }
                    }
                    events.connected(handle);
                });
            }
        }
    }

    fn disconnect(&self, target: &BindTarget) {
        let mut state = self.lock();
        state.disconnect_count += 1;
        state.generation += 1;
        state.active = None;
        let cancelled = state.queued.len();
        state.queued.clear();
        debug!(target_name = target.name(), cancelled, "local disconnect");
    }
}
