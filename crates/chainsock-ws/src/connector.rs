//! WebSocket connector over `tokio-tungstenite`.

use std::io;

use async_trait::async_trait;
use chainsock_core::{PersistentProvider, ProviderConfig, ProviderError, SocketConnector, SocketReader, SocketWriter};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Provider talking to a node over a WebSocket.
pub type WsProvider = PersistentProvider<WsConnector>;

/// Map a tungstenite error into the provider taxonomy.
///
/// A closed connection surfaces as a broken pipe so the provider's socket
/// reset applies to websockets the same way it does to IPC.
fn ws_error(e: WsError) -> ProviderError {
    match e {
        WsError::Io(e) => ProviderError::Io(e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket connection closed").into()
        }
        other => ProviderError::WebSocket(other.to_string()),
    }
}

/// Opens WebSocket connections to one URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    type Reader = WsReader;
    type Writer = WsWriter;

    async fn open(&self) -> Result<(Self::Reader, Self::Writer), ProviderError> {
        let (stream, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(ws_error)?;
        tracing::debug!(url = %self.url, status = %response.status(), "websocket handshake complete");
        let (sink, stream) = stream.split();
        Ok((WsReader { stream }, WsWriter { sink }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> &'static str {
        "WsProvider"
    }
}

/// Read half: yields one frame payload per read.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl SocketReader for WsReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "websocket closed by peer");
                    return Ok(None);
                }
                // ping, pong and raw frames carry no JSON-RPC payload
                Some(Ok(_)) => continue,
                Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                )) => return Ok(None),
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }
}

/// Write half: one text frame per message.
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketWriter for WsWriter {
    async fn send_message(&mut self, message: &str) -> Result<(), ProviderError> {
        self.sink
            .send(Message::Text(message.to_owned().into()))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_error(e)),
        }
    }
}

/// Build a WebSocket provider for `url`.
pub fn ws_provider(url: impl Into<String>, config: ProviderConfig) -> WsProvider {
    PersistentProvider::new(WsConnector::new(url), config)
}
