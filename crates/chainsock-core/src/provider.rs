//! Persistent connection provider: the public protocol engine.
//!
//! Owns the transport socket's write half and exactly one message listener
//! per live socket. Requests are written under the connection lock so bytes
//! from two messages never interleave; responses are correlated by id through
//! the [`RequestProcessor`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::listener::MessageListener;
use crate::processor::RequestProcessor;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionId};
use crate::transport::{ConnectionState, SocketConnector, SocketWriter};

/// RPC used by [`PersistentProvider::is_connected`] as a no-op probe.
pub const LIVENESS_METHOD: &str = "web3_clientVersion";

struct LiveConnection<C: SocketConnector> {
    writer: C::Writer,
    swap_tx: mpsc::Sender<C::Reader>,
    listener: JoinHandle<Result<(), ProviderError>>,
}

enum WriteOutcome {
    Direct,
    AfterReset,
}

/// JSON-RPC engine over one persistent socket.
pub struct PersistentProvider<C: SocketConnector> {
    connector: C,
    config: ProviderConfig,
    processor: Arc<RequestProcessor>,
    state: Arc<watch::Sender<ConnectionState>>,
    connection: Mutex<Option<LiveConnection<C>>>,
    next_id: AtomicU64,
}

impl<C: SocketConnector> PersistentProvider<C> {
    pub fn new(connector: C, config: ProviderConfig) -> Self {
        Self {
            connector,
            config,
            processor: Arc::new(RequestProcessor::new()),
            state: Arc::new(watch::Sender::new(ConnectionState::Disconnected)),
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn processor(&self) -> &RequestProcessor {
        &self.processor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `true` if a socket is open, its listener is still running and the node
    /// has not closed its end. Local check only.
    pub async fn is_live(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|live| self.usable(live))
    }

    fn usable(&self, live: &LiveConnection<C>) -> bool {
        !live.listener.is_finished() && !self.processor.is_peer_closed()
    }

    /// Open the socket and start its listener, retrying with exponential backoff.
    ///
    /// A no-op when a live connection already exists. A connection whose
    /// listener has stopped, or whose peer has hung up, is torn down and
    /// re-established.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|live| self.usable(live)) {
            tracing::debug!(endpoint = %self.endpoint(), "already connected");
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            tracing::info!(endpoint = %self.endpoint(), "connection is dead, re-establishing");
            self.teardown(stale).await;
        }

        self.state.send_replace(ConnectionState::Connecting);
        let mut backoff = self.config.backoff().start();
        loop {
            let attempt = backoff.begin_attempt();
            match self.connector.open().await {
                Ok((reader, writer)) => {
                    *slot = Some(self.spawn_listener(reader, writer));
                    self.state.send_replace(ConnectionState::Connected);
                    tracing::info!(endpoint = %self.endpoint(), attempt, "connected");
                    return Ok(());
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::info!(
                            endpoint = %self.endpoint(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "could not connect to endpoint, retrying"
                        );
                        time::sleep(delay).await;
                    }
                    None => {
                        self.state.send_replace(ConnectionState::Failed);
                        tracing::error!(
                            endpoint = %self.endpoint(),
                            attempts = attempt,
                            error = %e,
                            "connection retries exhausted"
                        );
                        return Err(ProviderError::ConnectionFailed {
                            endpoint: self.endpoint().to_string(),
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Connect unless the current socket is live.
    pub async fn ensure_connected(&self) -> Result<(), ProviderError> {
        if self.is_live().await {
            return Ok(());
        }
        self.connect().await
    }

    /// Close the socket, stop the listener and clear every cache. No-op when disconnected.
    pub async fn disconnect(&self) {
        let mut slot = self.connection.lock().await;
        let Some(live) = slot.take() else {
            return;
        };
        self.state.send_replace(ConnectionState::Closing);
        self.teardown(live).await;
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::debug!(endpoint = %self.endpoint(), "successfully disconnected from endpoint");
    }

    fn spawn_listener(&self, reader: C::Reader, writer: C::Writer) -> LiveConnection<C> {
        let (swap_tx, swaps) = mpsc::channel(1);
        let listener = MessageListener {
            endpoint: self.endpoint().to_string(),
            reader,
            swaps,
            processor: Arc::clone(&self.processor),
            policy: self.config.listener_policy(),
            state: Arc::clone(&self.state),
        };
        LiveConnection {
            writer,
            swap_tx,
            listener: tokio::spawn(listener.run()),
        }
    }

    // The listener is awaited before the caches are cleared so no delivery races the clear.
    async fn teardown(&self, mut live: LiveConnection<C>) {
        if let Err(e) = live.writer.close().await {
            tracing::debug!(endpoint = %self.endpoint(), error = %e, "error while closing socket");
        }
        drop(live.swap_tx);
        live.listener.abort();
        match live.listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(endpoint = %self.endpoint(), error = %e, "listener had exited with error"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(endpoint = %self.endpoint(), error = %e, "listener task panicked"),
        }
        self.processor.clear_caches();
    }

    fn next_request_id(&self) -> RpcId {
        RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send `method` with a fresh id and wait for its response.
    pub async fn make_request(&self, method: &str, params: Vec<Value>) -> Result<JsonRpcResponse, ProviderError> {
        let req = JsonRpcRequest::with_id(self.next_request_id(), method, params);
        self.send_request(req).await
    }

    /// Send a request carrying its own id and wait for the response.
    pub async fn send_request(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
        let payload = serde_json::to_string(&req)?;
        let mut waiter = self.processor.register_request(&req.id)?;

        match self.write_with_reset(&payload).await {
            Ok(WriteOutcome::Direct) => {}
            Ok(WriteOutcome::AfterReset) => match waiter.try_recv() {
                Ok(response) => return Ok(response),
                // the listener saw the old socket close and dropped this waiter
                Err(TryRecvError::Closed) => waiter = self.processor.register_request(&req.id)?,
                Err(TryRecvError::Empty) => {}
            },
            Err(e) => {
                self.processor.forget_request(&req.id);
                return Err(e);
            }
        }

        self.await_response(&req.id, waiter).await
    }

    /// Call `method` and deserialize its `result`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, ProviderError> {
        let resp = self.make_request(method, params).await?;
        let result = resp.into_result().map_err(ProviderError::Rpc)?;
        serde_json::from_value(result).map_err(ProviderError::Deserialization)
    }

    async fn write_with_reset(&self, payload: &str) -> Result<WriteOutcome, ProviderError> {
        let mut slot = self.connection.lock().await;
        let live = match slot.as_mut() {
            Some(live) if !live.listener.is_finished() => live,
            Some(_) => return Err(self.processor.closed_error()),
            None => return Err(ProviderError::NotConnected),
        };

        if self.processor.is_peer_closed() {
            tracing::info!(endpoint = %self.endpoint(), "socket was closed by peer, resetting before write");
            self.reset_socket(live).await?;
            live.writer.send_message(payload).await?;
            return Ok(WriteOutcome::AfterReset);
        }

        match live.writer.send_message(payload).await {
            Ok(()) => Ok(WriteOutcome::Direct),
            Err(e) if e.is_broken_pipe() => {
                tracing::warn!(
                    endpoint = %self.endpoint(),
                    error = %e,
                    "broken pipe, resetting socket and retrying once"
                );
                // a failed reopen reports the broken pipe that triggered it
                if let Err(reopen) = self.reset_socket(live).await {
                    tracing::warn!(endpoint = %self.endpoint(), error = %reopen, "could not reopen socket");
                    return Err(e);
                }
                live.writer.send_message(payload).await?;
                Ok(WriteOutcome::AfterReset)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the socket under the running listener.
    async fn reset_socket(&self, live: &mut LiveConnection<C>) -> Result<(), ProviderError> {
        if let Err(e) = live.writer.close().await {
            tracing::debug!(endpoint = %self.endpoint(), error = %e, "error while closing broken socket");
        }
        let (reader, writer) = self.connector.open().await?;
        live.writer = writer;
        if live.swap_tx.send(reader).await.is_err() {
            return Err(self.processor.closed_error());
        }
        self.processor.reopen();
        Ok(())
    }

    async fn await_response(
        &self,
        id: &RpcId,
        waiter: oneshot::Receiver<JsonRpcResponse>,
    ) -> Result<JsonRpcResponse, ProviderError> {
        let started = Instant::now();
        match time::timeout(self.config.request_timeout(), waiter).await {
            Ok(Ok(response)) => {
                tracing::debug!(id = %id, "received response");
                Ok(response)
            }
            Ok(Err(_)) => Err(self.processor.closed_error()),
            Err(_) => {
                self.processor.abandon_request(id);
                Err(ProviderError::Timeout {
                    id: id.clone(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// End-to-end liveness probe: issues a no-op RPC over the socket.
    ///
    /// Connection failures and timeouts report `Ok(false)`, or
    /// [`ProviderError::Unreachable`] when `show_traceback` is set.
    pub async fn is_connected(&self, show_traceback: bool) -> Result<bool, ProviderError> {
        match self.make_request(LIVENESS_METHOD, vec![]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_connection_error() || matches!(e, ProviderError::Timeout { .. }) => {
                if show_traceback {
                    return Err(ProviderError::Unreachable {
                        endpoint: self.endpoint().to_string(),
                        source: Box::new(e),
                    });
                }
                tracing::debug!(endpoint = %self.endpoint(), error = %e, "liveness probe failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Subscribe via `eth_subscribe`. Pushes queue up until read.
    pub async fn subscribe(&self, kind: &str, params: Vec<Value>) -> Result<SubscriptionId, ProviderError> {
        let params = std::iter::once(Value::String(kind.to_string()))
            .chain(params)
            .collect();
        let id = SubscriptionId(self.call::<String>("eth_subscribe", params).await?);
        self.processor.open_subscription(&id);
        tracing::info!(endpoint = %self.endpoint(), subscription = %id, kind, "subscribed");
        Ok(id)
    }

    /// Cancel a subscription via `eth_unsubscribe` and drop its queue.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, ProviderError> {
        let removed: bool = self
            .call("eth_unsubscribe", vec![Value::String(id.0.clone())])
            .await?;
        let discarded = self.processor.remove_subscription(id);
        if !discarded.is_empty() {
            tracing::debug!(subscription = %id, count = discarded.len(), "discarded queued notifications");
        }
        Ok(removed)
    }

    /// Wait for the next push on `id`. Fails if the connection is torn down meanwhile.
    pub async fn next_notification(&self, id: &SubscriptionId) -> Result<Value, ProviderError> {
        self.processor.next_subscription(id).await
    }

    pub fn try_next_notification(&self, id: &SubscriptionId) -> Option<Value> {
        self.processor.pop_subscription(id)
    }

    pub fn pending_notifications(&self, id: &SubscriptionId) -> usize {
        self.processor.pending_notifications(id)
    }
}

impl<C: SocketConnector> std::fmt::Display for PersistentProvider<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} {}>", self.connector.kind(), self.endpoint())
    }
}
