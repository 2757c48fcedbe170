//! IPC socket connector.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chainsock_core::transport::DEFAULT_READ_CHUNK;
use chainsock_core::{
    ByteStreamReader, ByteStreamWriter, PersistentProvider, ProviderConfig, ProviderError, SocketConnector,
};
use tokio::io::{ReadHalf, WriteHalf};

use crate::path::{default_ipc_path, resolve_ipc_path};

#[cfg(unix)]
type IpcStream = tokio::net::UnixStream;
#[cfg(windows)]
type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Provider talking to a node over its local IPC endpoint.
pub type IpcProvider = PersistentProvider<IpcConnector>;

/// Opens connections to one IPC path.
#[derive(Debug, Clone)]
pub struct IpcConnector {
    path: PathBuf,
    endpoint: String,
    read_chunk_size: usize,
}

impl IpcConnector {
    /// `path` is expanded (`~`) and made absolute.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = resolve_ipc_path(path);
        Self {
            endpoint: path.display().to_string(),
            path,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }

    /// Connector for the platform's default geth IPC path.
    pub fn default_path() -> Result<Self, ProviderError> {
        default_ipc_path()
            .map(Self::new)
            .ok_or_else(|| ProviderError::Other("cannot determine default IPC path: home directory unknown".into()))
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
async fn open_stream(path: &Path) -> io::Result<IpcStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn open_stream(path: &Path) -> io::Result<IpcStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

#[async_trait]
impl SocketConnector for IpcConnector {
    type Reader = ByteStreamReader<ReadHalf<IpcStream>>;
    type Writer = ByteStreamWriter<WriteHalf<IpcStream>>;

    async fn open(&self) -> Result<(Self::Reader, Self::Writer), ProviderError> {
        let stream = open_stream(&self.path).await?;
        tracing::debug!(path = %self.endpoint, "opened IPC socket");
        let (rd, wr) = tokio::io::split(stream);
        Ok((
            ByteStreamReader::with_chunk_size(rd, self.read_chunk_size),
            ByteStreamWriter::new(wr),
        ))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn kind(&self) -> &'static str {
        "IpcProvider"
    }
}

/// Build an IPC provider. The read chunk size comes from `config`.
pub fn ipc_provider(path: impl AsRef<Path>, config: ProviderConfig) -> IpcProvider {
    let connector = IpcConnector::new(path).with_read_chunk_size(config.read_chunk_size);
    PersistentProvider::new(connector, config)
}
