//! Background message listener: one task per live transport socket.
//!
//! Reads raw chunks, frames them into JSON values, classifies each value as a
//! subscription push or a response and deposits it in the [`RequestProcessor`].
//! A broken-pipe reset hands the listener a replacement reader through
//! `swaps`; the framing buffer restarts with the new socket while the
//! processor state is kept.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::error::ProviderError;
use crate::framing::MessageFramer;
use crate::policy::ListenerFaultPolicy;
use crate::processor::RequestProcessor;
use crate::request::is_subscription_message;
use crate::transport::{ConnectionState, SocketReader};

/// Everything a listener task needs, moved into the task at spawn.
pub(crate) struct MessageListener<R> {
    pub endpoint: String,
    pub reader: R,
    pub swaps: mpsc::Receiver<R>,
    pub processor: Arc<RequestProcessor>,
    pub policy: ListenerFaultPolicy,
    pub state: Arc<watch::Sender<ConnectionState>>,
}

enum Step {
    Continue,
    PeerClosed,
}

impl<R: SocketReader> MessageListener<R> {
    /// Run until the provider drops the swap channel or a strict-mode fault occurs.
    pub async fn run(mut self) -> Result<(), ProviderError> {
        tracing::info!(
            endpoint = %self.endpoint,
            policy = %self.policy,
            "socket listener background task started"
        );
        let mut framer = MessageFramer::new();

        loop {
            // cede control between reads so callers sharing the runtime are not starved
            tokio::task::yield_now().await;

            let step = tokio::select! {
                biased;
                swap = self.swaps.recv() => match swap {
                    Some(reader) => {
                        tracing::debug!(endpoint = %self.endpoint, "listener switched to reset socket");
                        self.resume(reader, &mut framer);
                        continue;
                    }
                    None => {
                        tracing::debug!(endpoint = %self.endpoint, "listener released by provider");
                        return Ok(());
                    }
                },
                chunk = self.reader.read_chunk() => self.handle_chunk(chunk, &mut framer),
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::PeerClosed) => {
                    if !self.wait_for_replacement(&mut framer).await {
                        return Ok(());
                    }
                }
                Err(e) => self.on_fault(e, &mut framer)?,
            }
        }
    }

    fn handle_chunk(
        &self,
        chunk: Result<Option<Vec<u8>>, ProviderError>,
        framer: &mut MessageFramer,
    ) -> Result<Step, ProviderError> {
        let Some(bytes) = chunk? else {
            return Ok(Step::PeerClosed);
        };
        framer.push(&bytes);

        loop {
            match framer.next_message() {
                Ok(Some(message)) => {
                    let is_subscription = is_subscription_message(&message);
                    match self.processor.cache_raw_response(message, is_subscription) {
                        Ok(()) => {}
                        // the framer is already past the value, so only this message is lost
                        Err(e @ (ProviderError::Deserialization(_) | ProviderError::InvalidMessage(_))) => {
                            tracing::warn!(
                                endpoint = %self.endpoint,
                                error = %e,
                                "unexpected message shape on socket, skipping"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(None) => return Ok(Step::Continue),
                Err(malformed) => {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        error = %malformed,
                        dropped_bytes = framer.buffered(),
                        "malformed message on socket, resetting buffer"
                    );
                    framer.reset();
                    return Ok(Step::Continue);
                }
            }
        }
    }

    fn on_fault(&self, error: ProviderError, framer: &mut MessageFramer) -> Result<(), ProviderError> {
        match self.policy {
            ListenerFaultPolicy::Strict => {
                tracing::error!(
                    endpoint = %self.endpoint,
                    error = %error,
                    "exception in listener, failing connection"
                );
                self.processor.fail(error.to_string());
                self.state.send_replace(ConnectionState::Disconnected);
                Err(error)
            }
            ListenerFaultPolicy::Lenient => {
                tracing::error!(
                    endpoint = %self.endpoint,
                    error = %error,
                    "exception caught in listener, keeping listener background task alive"
                );
                framer.reset();
                Ok(())
            }
        }
    }

    /// The node closed its end. Returns `false` once the provider lets go.
    async fn wait_for_replacement(&mut self, framer: &mut MessageFramer) -> bool {
        // a reset already swapped in a new socket; waiters registered for it stay
        if let Ok(reader) = self.swaps.try_recv() {
            tracing::debug!(endpoint = %self.endpoint, "replaced socket reached end of stream");
            self.resume(reader, framer);
            return true;
        }
        tracing::warn!(endpoint = %self.endpoint, "socket closed by peer");
        self.processor.close_by_peer();
        self.state.send_replace(ConnectionState::Disconnected);
        match self.swaps.recv().await {
            Some(reader) => {
                tracing::debug!(endpoint = %self.endpoint, "listener resumed on reset socket");
                self.resume(reader, framer);
                true
            }
            None => false,
        }
    }

    fn resume(&mut self, reader: R, framer: &mut MessageFramer) {
        self.reader = reader;
        framer.reset();
        self.processor.reopen();
        self.state.send_if_modified(|state| {
            let changed = *state != ConnectionState::Connected;
            *state = ConnectionState::Connected;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CacheKey, RpcId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted chunks, then parks forever.
    struct ScriptedReader {
        chunks: VecDeque<Result<Option<Vec<u8>>, ProviderError>>,
    }

    impl ScriptedReader {
        fn new(chunks: Vec<Result<Option<&str>, ProviderError>>) -> Self {
            Self {
                chunks: chunks
                    .into_iter()
                    .map(|c| c.map(|o| o.map(|s| s.as_bytes().to_vec())))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl SocketReader for ScriptedReader {
        async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
            match self.chunks.pop_front() {
                Some(chunk) => chunk,
                None => futures::future::pending().await,
            }
        }
    }

    fn listener(
        reader: ScriptedReader,
        policy: ListenerFaultPolicy,
    ) -> (
        MessageListener<ScriptedReader>,
        mpsc::Sender<ScriptedReader>,
        Arc<RequestProcessor>,
        Arc<watch::Sender<ConnectionState>>,
    ) {
        let (swap_tx, swaps) = mpsc::channel(1);
        let processor = Arc::new(RequestProcessor::new());
        let state = Arc::new(watch::Sender::new(ConnectionState::Connected));
        let l = MessageListener {
            endpoint: "test".into(),
            reader,
            swaps,
            processor: Arc::clone(&processor),
            policy,
            state: Arc::clone(&state),
        };
        (l, swap_tx, processor, state)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn split_and_concatenated_messages_are_routed() {
        let reader = ScriptedReader::new(vec![
            Ok(Some(r#"{"id":1,"res"#)),
            Ok(Some(r#"ult":"a"}{"method":"eth_subscription","params":{"subscription":"0xs","result":1}}"#)),
            Ok(Some(r#" {"id":2,"result":"b"}"#)),
        ]);
        let (l, _swap_tx, processor, _) = listener(reader, ListenerFaultPolicy::Strict);
        let task = tokio::spawn(l.run());
        settle().await;

        let one = processor.pop_raw_response(&CacheKey::from(&RpcId::Number(1))).unwrap();
        let two = processor.pop_raw_response(&CacheKey::from(&RpcId::Number(2))).unwrap();
        assert_eq!(one.result, Some(json!("a")));
        assert_eq!(two.result, Some(json!("b")));
        assert_eq!(processor.pop_subscription(&"0xs".into()), Some(json!(1)));
        task.abort();
    }

    #[tokio::test]
    async fn malformed_message_does_not_stall_the_listener() {
        let reader = ScriptedReader::new(vec![
            Ok(Some("{\"id\":1,]")),
            Ok(Some(r#"{"id":3,"result":true}"#)),
        ]);
        let (l, _swap_tx, processor, _) = listener(reader, ListenerFaultPolicy::Strict);
        let task = tokio::spawn(l.run());
        settle().await;

        assert!(processor.pop_raw_response(&CacheKey::from(&RpcId::Number(3))).is_some());
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn strict_policy_fails_the_connection() {
        let reader = ScriptedReader::new(vec![
            Ok(Some(r#"{"id":9,"result":1}"#)),
            Ok(Some(r#"{"id":9,"result":2}"#)),
        ]);
        let (l, _swap_tx, processor, state) = listener(reader, ListenerFaultPolicy::Strict);
        let waiter = processor.register_request(&RpcId::Number(1)).unwrap();

        let result = l.run().await;
        assert!(matches!(result, Err(ProviderError::DuplicateResponseId(_))));
        assert!(waiter.await.is_err());
        assert!(matches!(processor.closed_error(), ProviderError::Listener(_)));
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn lenient_policy_keeps_listening() {
        let reader = ScriptedReader::new(vec![
            Err(ProviderError::Other("transient read failure".into())),
            Ok(Some(r#"{"id":4,"result":"after"}"#)),
        ]);
        let (l, _swap_tx, processor, state) = listener(reader, ListenerFaultPolicy::Lenient);
        let task = tokio::spawn(l.run());
        settle().await;

        assert!(processor.pop_raw_response(&CacheKey::from(&RpcId::Number(4))).is_some());
        assert_eq!(*state.borrow(), ConnectionState::Connected);
        task.abort();
    }

    #[tokio::test]
    async fn eof_on_an_already_replaced_socket_keeps_waiters() {
        let reader = ScriptedReader::new(vec![Ok(None)]);
        let (mut l, swap_tx, processor, state) = listener(reader, ListenerFaultPolicy::Strict);
        swap_tx
            .send(ScriptedReader::new(vec![Ok(Some(r#"{"id":7,"result":"new"}"#))]))
            .await
            .unwrap();
        let waiter = processor.register_request(&RpcId::Number(7)).unwrap();
        let mut framer = MessageFramer::new();

        assert!(l.wait_for_replacement(&mut framer).await);
        assert!(!processor.is_peer_closed());
        assert_eq!(processor.in_flight(), 1);
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        let task = tokio::spawn(l.run());
        assert_eq!(waiter.await.unwrap().result, Some(json!("new")));
        task.abort();
    }

    #[tokio::test]
    async fn strict_policy_skips_badly_shaped_messages() {
        let reader = ScriptedReader::new(vec![Ok(Some(concat!(
            r#"{"method":"eth_subscription","params":{"result":1}}"#,
            r#"{"id":-4,"result":0}"#,
            r#"{"jsonrpc":"2.0"}"#,
            r#"{"id":6,"result":"kept"}"#,
        )))]);
        let (l, _swap_tx, processor, state) = listener(reader, ListenerFaultPolicy::Strict);
        let waiter = processor.register_request(&RpcId::Number(6)).unwrap();
        let task = tokio::spawn(l.run());

        assert_eq!(waiter.await.unwrap().result, Some(json!("kept")));
        settle().await;
        assert!(!task.is_finished());
        assert_eq!(*state.borrow(), ConnectionState::Connected);
        task.abort();
    }

    #[tokio::test]
    async fn peer_close_fails_waiters_and_accepts_replacement() {
        let reader = ScriptedReader::new(vec![Ok(None)]);
        let (l, swap_tx, processor, state) = listener(reader, ListenerFaultPolicy::Strict);
        let waiter = processor.register_request(&RpcId::Number(1)).unwrap();
        let task = tokio::spawn(l.run());
        settle().await;
        assert!(waiter.await.is_err());
        assert!(processor.is_peer_closed());
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        swap_tx
            .send(ScriptedReader::new(vec![Ok(Some(r#"{"id":5,"result":0}"#))]))
            .await
            .unwrap();
        settle().await;
        assert!(processor.pop_raw_response(&CacheKey::from(&RpcId::Number(5))).is_some());
        assert!(!processor.is_peer_closed());
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        drop(swap_tx);
        assert!(task.await.unwrap().is_ok());
    }
}
