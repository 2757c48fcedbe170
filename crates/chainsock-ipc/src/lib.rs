//! chainsock-ipc: local IPC transport for chainsock.
//!
//! Connects to a node's IPC endpoint: a unix domain socket on unix, a named
//! pipe on Windows. Bytes are read in fixed-size chunks and framed by the
//! core listener.

pub mod connector;
pub mod path;

pub use connector::{ipc_provider, IpcConnector, IpcProvider};
pub use path::{default_ipc_path, resolve_ipc_path};
