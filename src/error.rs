//! Typed failures surfaced by the connection manager and the proxies.
//!
//! Unexpected transport death never appears here: the manager recovers from
//! it before any caller can observe it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::MethodId;
use crate::transport::HandleId;

/// Application-level error reported by the remote side of a transaction.
///
/// Shaped like a JSON-RPC 2.0 error object so it travels unchanged over the
/// Unix socket transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("Remote error {code}: {message}")]
pub struct RemoteFault {
    /// Error code (JSON-RPC reserved codes or -32000 for application errors)
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RemoteFault {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const APPLICATION_ERROR: i32 = -32000;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// An error raised by the service implementation itself.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(Self::APPLICATION_ERROR, message)
    }

    pub fn method_not_found(method: &MethodId) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
            .with_data(serde_json::json!({ "method": method.as_str() }))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Failures of the transport itself, as opposed to the remote service.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to reach the endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The handle was used after it stopped being live.
    #[error("Transport handle {0} is dead")]
    DeadObject(HandleId),

    /// Framing or message-shape violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Arguments could not be serialized into a transaction.
    #[error("Failed to encode transaction: {0}")]
    Encode(#[source] serde_json::Error),

    /// Reply payload did not match the declared return type.
    #[error("Failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    /// No reply within the transport's call timeout.
    #[error("Transaction timed out after {0}s")]
    Timeout(u64),

    /// The connection closed while a transaction was in flight.
    #[error("Transport closed before a reply arrived")]
    Closed,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                TransportError::ConnectionFailed(err)
            }
            _ => TransportError::Io(err),
        }
    }
}

/// Why a request for a transport handle did not produce one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The transport reported that the connection could not be established.
    #[error("Connect to {target} failed: {reason}")]
    ConnectFailed {
        /// Display form of the bind target
        target: String,
        /// Failure reported by the transport
        reason: String,
    },

    /// The connection was released while the request was still waiting.
    #[error("Connection to {0} was released before a handle arrived")]
    Released(String),

    /// The connection manager was dropped while the request was waiting.
    #[error("Connection manager dropped before a handle arrived")]
    ManagerGone,
}

/// Failure of a single proxy method call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The proxy's captured handle is no longer live. Acquire a fresh handle
    /// and build a new proxy.
    #[error("Stale handle: {0} is no longer connected")]
    StaleHandle(HandleId),

    /// The remote side answered with an application error.
    #[error(transparent)]
    Remote(#[from] RemoteFault),

    /// The transaction could not be sent or its reply could not be decoded.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The call does not match the interface descriptor.
    #[error("Invalid call: {0}")]
    InvalidCall(String),
}

impl CallError {
    /// Shorthand for service implementations reporting an application error.
    pub fn remote(message: impl Into<String>) -> Self {
        CallError::Remote(RemoteFault::application(message))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CallError::StaleHandle(_))
    }
}

impl From<CallError> for RemoteFault {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Remote(fault) => fault,
            other => RemoteFault::internal(other.to_string()),
        }
    }
}
