//! Method invocation bridge.
//!
//! Turns one method call into one transport transaction and the transaction's
//! reply back into the method's declared return type.
//!
//! # Transaction format
//!
//! ```text
//! Transaction { method: "calculator.plus", args: [10, 20] }
//! Reply::Payload(30) | Reply::Fault { code, message, data }
//! ```
//!
//! Exact byte framing belongs to the transport. A single invocation is never
//! retried here: once sent, it either replies or fails.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CallError, RemoteFault, TransportError};
use crate::transport::TransportHandle;

/// Stable identity of a method: `"<interface>.<method>"`.
///
/// Both halves come from the interface declaration, so independently built
/// clients and servers agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(String);

impl MethodId {
    pub fn new(interface: &str, method: &str) -> Self {
        Self(format!("{}.{}", interface, method))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interface half of the identity (empty if the identity has no dot).
    pub fn interface(&self) -> &str {
        self.0.rsplit_once('.').map(|(iface, _)| iface).unwrap_or("")
    }

    /// Method half of the identity.
    pub fn method(&self) -> &str {
        self.0
            .rsplit_once('.')
            .map(|(_, method)| method)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One method call: identity plus ordered argument payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub method: MethodId,
    pub args: Vec<Value>,
}

impl Transaction {
    pub fn new(method: MethodId, args: Vec<Value>) -> Self {
        Self { method, args }
    }
}

/// What the remote side answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Payload(Value),
    Fault(RemoteFault),
}

impl Reply {
    pub fn into_result(self) -> Result<Value, RemoteFault> {
        match self {
            Reply::Payload(value) => Ok(value),
            Reply::Fault(fault) => Err(fault),
        }
    }
}

impl From<Result<Value, RemoteFault>> for Reply {
    fn from(outcome: Result<Value, RemoteFault>) -> Self {
        match outcome {
            Ok(value) => Reply::Payload(value),
            Err(fault) => Reply::Fault(fault),
        }
    }
}

/// Progress of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    NotSent,
    Sent,
    Replied,
    Failed,
}

/// A transaction on its way through the bridge.
///
/// `send` may run once; a second attempt fails instead of resending.
#[derive(Debug)]
pub struct Invocation {
    transaction: Option<Transaction>,
    method: MethodId,
    state: InvocationState,
}

impl Invocation {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            method: transaction.method.clone(),
            transaction: Some(transaction),
            state: InvocationState::NotSent,
        }
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    /// Send the transaction on `handle` and wait for the raw reply payload.
    pub async fn send(&mut self, handle: &TransportHandle) -> Result<Value, CallError> {
        let transaction = self.transaction.take().ok_or_else(|| {
            CallError::InvalidCall(format!("{} was already sent", self.method))
        })?;

        if !handle.is_alive() {
            self.state = InvocationState::Failed;
            return Err(CallError::StaleHandle(handle.id()));
        }

        self.state = InvocationState::Sent;
        debug!(handle = %handle.id(), method = %self.method, "transaction sent");

        match handle.transact(transaction).await {
            Ok(Reply::Payload(value)) => {
                self.state = InvocationState::Replied;
                Ok(value)
            }
            Ok(Reply::Fault(fault)) => {
                self.state = InvocationState::Replied;
                debug!(method = %self.method, code = fault.code, "remote fault");
                Err(CallError::Remote(fault))
            }
            Err(err) => {
                self.state = InvocationState::Failed;
                // A handle that died mid-flight is reported the same way as
                // one that was already dead.
                if !handle.is_alive() || matches!(err, TransportError::DeadObject(_)) {
                    return Err(CallError::StaleHandle(handle.id()));
                }
                warn!(method = %self.method, error = %err, "transaction failed");
                Err(CallError::Transport(err))
            }
        }
    }
}

/// Serialize one argument for a transaction.
pub fn encode_arg<T: Serialize + ?Sized>(value: &T) -> Result<Value, CallError> {
    serde_json::to_value(value).map_err(|e| CallError::Transport(TransportError::Encode(e)))
}

/// Deserialize a reply payload into the declared return type.
pub fn decode_reply<R: DeserializeOwned>(payload: Value) -> Result<R, CallError> {
    serde_json::from_value(payload).map_err(|e| CallError::Transport(TransportError::Decode(e)))
}

/// Perform `method(args)` on `handle` and return the raw reply payload.
pub async fn invoke(
    handle: &TransportHandle,
    method: MethodId,
    args: Vec<Value>,
) -> Result<Value, CallError> {
    Invocation::new(Transaction::new(method, args))
        .send(handle)
        .await
}

/// Perform `method(args)` on `handle` and decode the reply as `R`.
pub async fn invoke_typed<R: DeserializeOwned>(
    handle: &TransportHandle,
    method: MethodId,
    args: Vec<Value>,
) -> Result<R, CallError> {
    decode_reply(invoke(handle, method, args).await?)
}
