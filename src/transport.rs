//! Transport provider boundary.
//!
//! A [`Transport`] knows how to reach a [`BindTarget`] and reports the outcome
//! of each attempt through the [`ConnectionEvents`] it was handed. The
//! connection it establishes is represented by a [`TransportHandle`].
//!
//! Two providers ship with the crate:
//!
//! - [`local::LocalTransport`] - hosts a dispatcher in the same process
//! - [`crate::ipc::UnixTransport`] - JSON-RPC over a Unix domain socket

mod handle;
pub mod local;

pub use handle::{Binder, DeathNotifier, DeathWatch, HandleId, TransportHandle};

use crate::connection::{BindTarget, ConnectionEvents};

/// Host-supplied connection provider.
///
/// The connection manager calls both methods while holding its state lock,
/// so implementations must report through `events` (and through
/// [`TransportHandle::notify_death`]) from another thread or task, never from
/// inside `connect` or `disconnect` themselves.
pub trait Transport: Send + Sync + 'static {
    /// Start one connection attempt. Fire and forget: exactly one of
    /// `events.connected`, `events.disconnected` or `events.connect_failed`
    /// must follow.
    fn connect(&self, target: &BindTarget, events: ConnectionEvents);

    /// Tear down the binding to `target`, including an attempt still in
    /// flight. Invalidating the handle is the manager's job.
    fn disconnect(&self, target: &BindTarget);
}
