//! chainsock-core: persistent-connection JSON-RPC engine.
//!
//! Provides:
//! - [`framing::MessageFramer`]: incremental decoding of back-to-back JSON values
//! - [`processor::RequestProcessor`]: response correlation and subscription queues
//! - [`provider::PersistentProvider`]: connection lifecycle, retries and request dispatch
//! - [`facade::PersistentConnection`]: lazy connect, scoped connections, reconnect loops
//! - [`transport`]: the socket traits concrete transports implement

pub mod config;
pub mod error;
pub mod facade;
pub mod framing;
mod listener;
pub mod policy;
pub mod processor;
pub mod provider;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ProviderConfig;
pub use error::ProviderError;
pub use facade::PersistentConnection;
pub use framing::MessageFramer;
pub use policy::{BackoffPolicy, ListenerFaultPolicy};
pub use processor::RequestProcessor;
pub use provider::PersistentProvider;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionId};
pub use transport::{
    ByteStreamReader, ByteStreamWriter, ConnectionState, SocketConnector, SocketReader, SocketWriter,
};
