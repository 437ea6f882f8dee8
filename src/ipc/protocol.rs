//! JSON-RPC 2.0 message shapes carried by the socket transport.
//!
//! A transaction maps onto a request directly: the method identity is the
//! JSON-RPC method and the ordered arguments are the positional params.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::bridge::{MethodId, Reply, Transaction};
use crate::error::RemoteFault;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: MethodId,
    #[serde(default)]
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(transaction: Transaction, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: transaction.method,
            params: transaction.args,
            id,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        Transaction::new(self.method, self.params)
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
    pub id: Option<u64>,
}

// `"result": null` is a unit result, not a missing one.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(id: Option<u64>, error: RemoteFault) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn from_reply(id: u64, reply: Reply) -> Self {
        match reply {
            Reply::Payload(value) => Self::success(id, value),
            Reply::Fault(fault) => Self::error(Some(id), fault),
        }
    }

    /// `None` if the response carries neither a result nor an error.
    pub fn into_reply(self) -> Option<Reply> {
        match (self.error, self.result) {
            (Some(fault), _) => Some(Reply::Fault(fault)),
            (None, Some(value)) => Some(Reply::Payload(value)),
            (None, None) => None,
        }
    }
}
