//! Transport socket traits: the seam between the engine and a concrete byte stream.
//!
//! A [`SocketConnector`] opens a duplex connection and splits it into a
//! [`SocketReader`] (owned by the message listener) and a [`SocketWriter`]
//! (owned by the provider). Generic adapters for any tokio
//! `AsyncRead`/`AsyncWrite` pair live here so every byte-stream transport
//! (unix socket, named pipe, in-memory duplex) shares one implementation.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProviderError;

/// Default read size for byte-stream sockets.
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// State of a persistent connection.
///
/// ```text
/// Disconnected → Connecting → Connected → Closing → Disconnected
///                     └──────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket is open.
    Disconnected,
    /// `connect()` is attempting to open the socket.
    Connecting,
    /// Socket open and a listener is running.
    Connected,
    /// `disconnect()` is tearing the connection down.
    Closing,
    /// Connection retries were exhausted.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Read side of a transport socket.
#[async_trait]
pub trait SocketReader: Send + 'static {
    /// Read whatever is available. `Ok(None)` means the peer closed the stream.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProviderError>;
}

/// Write side of a transport socket.
#[async_trait]
pub trait SocketWriter: Send + 'static {
    /// Write one encoded message and wait until it is drained to the OS.
    async fn send_message(&mut self, message: &str) -> Result<(), ProviderError>;

    /// Close the socket.
    async fn close(&mut self) -> Result<(), ProviderError>;
}

/// Opens transport sockets for one endpoint.
///
/// # Object Safety
/// The associated types keep this trait static; providers are generic over it.
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    type Reader: SocketReader;
    type Writer: SocketWriter;

    /// Open a fresh socket to the endpoint.
    async fn open(&self) -> Result<(Self::Reader, Self::Writer), ProviderError>;

    /// Endpoint identifier (path or URI).
    fn endpoint(&self) -> &str;

    /// Short transport name used in log lines and `Display`.
    fn kind(&self) -> &'static str {
        "PersistentProvider"
    }
}

/// [`SocketReader`] over any `AsyncRead` byte stream.
pub struct ByteStreamReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> ByteStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_READ_CHUNK)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0; chunk_size.max(1)],
        }
    }
}

#[async_trait]
impl<R> SocketReader for ByteStreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

/// [`SocketWriter`] over any `AsyncWrite` byte stream.
pub struct ByteStreamWriter<W> {
    inner: W,
}

impl<W> ByteStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> SocketWriter for ByteStreamWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_message(&mut self, message: &str) -> Result<(), ProviderError> {
        self.inner.write_all(message.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            // the peer is already gone
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
