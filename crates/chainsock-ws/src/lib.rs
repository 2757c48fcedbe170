//! chainsock-ws: WebSocket transport for chainsock.
//!
//! Each text or binary frame payload is handed to the core listener as one
//! chunk; the framer still accepts several JSON values per frame.

pub mod connector;

pub use connector::{ws_provider, WsConnector, WsProvider, WsReader, WsWriter};
