//! Provider-level error types.

use std::time::Duration;

use thiserror::Error;

use crate::request::{JsonRpcError, RpcId};

/// Errors that can occur on a persistent connection.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Socket read/write/open failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// `connect()` gave up after the configured number of attempts.
    #[error("Could not connect to endpoint: {endpoint}. Retries exceeded max of {attempts}. Last error: {reason}")]
    ConnectionFailed {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// No socket has been opened for this provider.
    #[error("Connection to the socket has not been initiated for the provider")]
    NotConnected,

    /// The connection went away while a request was waiting.
    #[error("Connection closed before a response was received")]
    ConnectionClosed,

    /// The listener hit a fatal error in strict mode.
    #[error("Message listener failed: {0}")]
    Listener(String),

    /// No response arrived within `request_timeout`.
    #[error("Timed out waiting for response with request id `{id}` after {elapsed:?}")]
    Timeout { id: RpcId, elapsed: Duration },

    /// The node sent a second response for an id that is still unclaimed.
    #[error("Duplicate response for request id `{0}`")]
    DuplicateResponseId(RpcId),

    /// A request with this id is already waiting for its response.
    #[error("Request id `{0}` is already in flight")]
    DuplicateRequestId(RpcId),

    /// A decoded JSON value is neither a response nor a subscription push.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Payload could not be (de)serialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Liveness probe failed.
    #[error("Problem connecting to provider {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: Box<ProviderError>,
    },

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Returns `true` for a write into a broken or half-closed pipe.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }

    /// Returns `true` if the socket itself is unusable and needs a reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::WebSocket(_)
                | Self::NotConnected
                | Self::ConnectionClosed
                | Self::Listener(_)
                | Self::Unreachable { .. }
        )
    }

    /// Returns `true` if the connection is fine and the caller may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Rpc(_)
                | Self::Deserialization(_)
                | Self::InvalidMessage(_)
                | Self::DuplicateResponseId(_)
                | Self::DuplicateRequestId(_)
                | Self::Other(_)
        )
    }

    /// Returns `true` if retrying will not help without operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }
}
