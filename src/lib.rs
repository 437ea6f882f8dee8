//! Service Fetcher
//!
//! Typed proxies to services that live behind an out-of-process transport,
//! with connection setup, reconnection and request queuing handled for the
//! caller.
//!
//! - `connection` - the [`ConnectionManager`] owning one transport handle
//! - `pending` - callers waiting for that handle
//! - `proxy` - interface descriptors, generated proxies and dispatchers
//! - `bridge` - method call ⇄ transport transaction
//! - `transport` - the provider boundary, plus an in-process provider
//! - `ipc` - JSON-RPC over Unix domain sockets
//!
//! # Example
//!
//! ```ignore
//! use service_fetcher::calculator::{Calculator, CalculatorProxy};
//! use service_fetcher::ipc::UnixTransport;
//! use service_fetcher::{ConnectionManager, FetcherConfig};
//!
//! let config = FetcherConfig::from_env()?;
//! let transport = UnixTransport::from_config(tokio::runtime::Handle::current(), &config);
//! let manager = ConnectionManager::new(transport, config.bind_target("calculator"));
//!
//! let calculator: CalculatorProxy = manager.fetch().await?;
//! assert_eq!(calculator.plus(10, 20).await?, 30);
//! ```

pub mod bridge;
pub mod calculator;
pub mod config;
pub mod connection;
pub mod error;
pub mod ipc;
pub mod pending;
pub mod proxy;
pub mod transport;

pub use bridge::{invoke, MethodId, Reply, Transaction};
pub use config::FetcherConfig;
pub use connection::{BindTarget, ConnectionEvents, ConnectionManager, ConnectionState};
pub use error::{CallError, FetchError, RemoteFault, TransportError};
pub use pending::PendingHandle;
pub use proxy::{create_proxy, Dispatcher, DynamicProxy, InterfaceDescriptor, InterfaceProxy};
pub use transport::{Binder, DeathWatch, HandleId, Transport, TransportHandle};

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
    pub use serde_json;
}
