//! JSON-RPC transport over Unix domain sockets.
//!
//! ```text
//! ┌──────────────────────┐        Unix Socket        ┌──────────────────────┐
//! │  ConnectionManager   │ ◄───────────────────────► │   ipc::server        │
//! │  (UnixTransport)     │   JSON-RPC 2.0 + framing  │   (Dispatcher)       │
//! └──────────────────────┘                           └──────────────────────┘
//! ```
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 68\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"calculator.plus","params":[10,20],"id":1}
//! ```

mod client;
mod framing;
pub mod protocol;
pub mod server;

pub use client::{
    connect_with_retry, UnixTransport, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_CONNECT_ATTEMPTS,
};
pub use framing::{read_message, write_message, MAX_MESSAGE_SIZE};
pub use server::ServerHandle;
