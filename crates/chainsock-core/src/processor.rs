//! Request processor: the shared state between the message listener and callers.
//!
//! Holds two structures:
//! - the response cache, keyed by [`CacheKey`]. A caller registers a one-shot
//!   waiter before its request is written; the listener resolves it when the
//!   matching response arrives. Responses with no waiter are parked until popped.
//! - per-subscription queues, keyed by [`SubscriptionId`], read in arrival order.
//!
//! The listener is the only writer of new entries. Callers are the only readers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{oneshot, Notify};

use crate::error::ProviderError;
use crate::request::{CacheKey, JsonRpcResponse, RpcId, SubscriptionId, SubscriptionNotification};

/// Unclaimed responses kept before the oldest is evicted.
pub const MAX_PARKED_RESPONSES: usize = 1024;
/// Timed-out ids remembered so their late responses can be dropped.
pub const MAX_ABANDONED_REQUESTS: usize = 256;

enum Slot {
    Waiting(oneshot::Sender<JsonRpcResponse>),
    Ready(JsonRpcResponse),
}

#[derive(Default)]
struct ProcessorState {
    responses: HashMap<CacheKey, Slot>,
    /// Keys of `Ready` slots, oldest first.
    parked: VecDeque<CacheKey>,
    /// Oldest first.
    abandoned: VecDeque<CacheKey>,
    subscriptions: HashMap<SubscriptionId, VecDeque<Value>>,
    fault: Option<String>,
    peer_closed: bool,
    epoch: u64,
}

impl ProcessorState {
    fn park(&mut self, key: CacheKey, response: JsonRpcResponse) {
        if self.parked.len() >= MAX_PARKED_RESPONSES {
            if let Some(oldest) = self.parked.pop_front() {
                tracing::debug!(key = %oldest, "evicting oldest unclaimed response");
                self.responses.remove(&oldest);
            }
        }
        self.parked.push_back(key.clone());
        self.responses.insert(key, Slot::Ready(response));
    }

    fn unpark(&mut self, key: &CacheKey) {
        if let Some(i) = self.parked.iter().position(|k| k == key) {
            self.parked.remove(i);
        }
    }

    fn abandon(&mut self, key: CacheKey) {
        if self.abandoned.len() >= MAX_ABANDONED_REQUESTS {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(key);
    }

    fn take_abandoned(&mut self, key: &CacheKey) -> bool {
        match self.abandoned.iter().position(|k| k == key) {
            Some(i) => {
                self.abandoned.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Response cache and subscription queues for one provider.
#[derive(Default)]
pub struct RequestProcessor {
    state: Mutex<ProcessorState>,
    notify: Notify,
}

impl RequestProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deposit a decoded message from the listener.
    ///
    /// Subscription pushes are appended to their queue (created if absent).
    /// Responses resolve a registered waiter or are parked under their cache key.
    /// A second response for a key that is still parked is rejected.
    pub fn cache_raw_response(&self, message: Value, is_subscription: bool) -> Result<(), ProviderError> {
        if is_subscription {
            let note: SubscriptionNotification = serde_json::from_value(message)?;
            let id = note.params.subscription.clone();
            self.lock()
                .subscriptions
                .entry(id)
                .or_default()
                .push_back(note.into_result());
            self.notify.notify_waiters();
            return Ok(());
        }

        if message.get("id").is_none() {
            return Err(ProviderError::InvalidMessage(format!(
                "message has neither a request id nor a subscription method: {message}"
            )));
        }
        let response: JsonRpcResponse = serde_json::from_value(message)?;
        let key = CacheKey::from(&response.id);

        let mut state = self.lock();
        if state.take_abandoned(&key) {
            tracing::debug!(id = %response.id, "dropping late response for timed-out request");
            return Ok(());
        }
        match state.responses.remove(&key) {
            Some(Slot::Waiting(tx)) => {
                if let Err(response) = tx.send(response) {
                    tracing::debug!(id = %response.id, "waiter went away before its response arrived");
                }
                Ok(())
            }
            Some(Slot::Ready(existing)) => {
                let id = existing.id.clone();
                state.responses.insert(key, Slot::Ready(existing));
                Err(ProviderError::DuplicateResponseId(id))
            }
            None => {
                state.park(key, response);
                Ok(())
            }
        }
    }

    /// Remove and return a parked response. `None` if nothing is parked under `key`.
    pub fn pop_raw_response(&self, key: &CacheKey) -> Option<JsonRpcResponse> {
        let mut state = self.lock();
        match state.responses.remove(key) {
            Some(Slot::Ready(response)) => {
                tracing::debug!(key = %key, "popping response from cache");
                state.unpark(key);
                Some(response)
            }
            Some(waiting @ Slot::Waiting(_)) => {
                state.responses.insert(key.clone(), waiting);
                None
            }
            None => None,
        }
    }

    /// Register interest in the response for `id`.
    ///
    /// Must be called before the request is written so a fast response cannot
    /// slip past. If the response is already parked the receiver resolves at once.
    pub fn register_request(&self, id: &RpcId) -> Result<oneshot::Receiver<JsonRpcResponse>, ProviderError> {
        let key = CacheKey::from(id);
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        state.take_abandoned(&key);
        match state.responses.remove(&key) {
            Some(Slot::Ready(response)) => {
                state.unpark(&key);
                let _ = tx.send(response);
            }
            Some(waiting @ Slot::Waiting(_)) => {
                state.responses.insert(key, waiting);
                return Err(ProviderError::DuplicateRequestId(id.clone()));
            }
            None => {
                state.responses.insert(key, Slot::Waiting(tx));
            }
        }
        Ok(rx)
    }

    /// Withdraw a waiter that will never be answered (write failed).
    pub fn forget_request(&self, id: &RpcId) {
        let key = CacheKey::from(id);
        let mut state = self.lock();
        if matches!(state.responses.get(&key), Some(Slot::Waiting(_))) {
            state.responses.remove(&key);
        }
    }

    /// Withdraw a waiter that timed out; a response arriving later is dropped.
    pub fn abandon_request(&self, id: &RpcId) {
        let key = CacheKey::from(id);
        let mut state = self.lock();
        match state.responses.remove(&key) {
            Some(Slot::Waiting(_)) => {
                state.abandon(key);
            }
            Some(ready @ Slot::Ready(_)) => {
                state.responses.insert(key, ready);
            }
            None => {}
        }
    }

    /// Empty the response cache and every subscription queue.
    ///
    /// Outstanding waiters are dropped and resolve to a connection-closed error.
    pub fn clear_caches(&self) {
        let mut state = self.lock();
        state.responses.clear();
        state.parked.clear();
        state.abandoned.clear();
        state.subscriptions.clear();
        state.fault = None;
        state.peer_closed = false;
        state.epoch += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Fail every outstanding waiter with a listener fault.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        state.responses.retain(|_, slot| matches!(slot, Slot::Ready(_)));
        state.fault = Some(reason.into());
        drop(state);
        self.notify.notify_waiters();
    }

    /// The node closed its end: drop outstanding waiters and wake subscription readers.
    ///
    /// Parked responses and queued notifications are kept until the next clear.
    pub fn close_by_peer(&self) {
        let mut state = self.lock();
        state.responses.retain(|_, slot| matches!(slot, Slot::Ready(_)));
        state.peer_closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// A replacement socket is being read; undoes [`close_by_peer`](Self::close_by_peer).
    pub fn reopen(&self) {
        self.lock().peer_closed = false;
    }

    /// `true` between a peer close and the next reopen or clear.
    pub fn is_peer_closed(&self) -> bool {
        self.lock().peer_closed
    }

    /// The error a waiter should report when its channel is dropped.
    pub fn closed_error(&self) -> ProviderError {
        match &self.lock().fault {
            Some(reason) => ProviderError::Listener(reason.clone()),
            None => ProviderError::ConnectionClosed,
        }
    }

    /// Create an empty queue for `id` if none exists yet.
    pub fn open_subscription(&self, id: &SubscriptionId) {
        self.lock().subscriptions.entry(id.clone()).or_default();
    }

    /// Drop the queue for `id`, returning any notifications still in it.
    pub fn remove_subscription(&self, id: &SubscriptionId) -> Vec<Value> {
        self.lock()
            .subscriptions
            .remove(id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Pop the oldest queued notification for `id`.
    pub fn pop_subscription(&self, id: &SubscriptionId) -> Option<Value> {
        self.lock()
            .subscriptions
            .get_mut(id)
            .and_then(VecDeque::pop_front)
    }

    /// Wait for the next notification for `id`.
    ///
    /// Resolves to an error if the caches are cleared, the listener fails or the
    /// node closes the socket while waiting. Notifications already queued are
    /// still returned first.
    pub async fn next_subscription(&self, id: &SubscriptionId) -> Result<Value, ProviderError> {
        let epoch = self.lock().epoch;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return Err(ProviderError::ConnectionClosed);
                }
                if let Some(value) = state.subscriptions.get_mut(id).and_then(VecDeque::pop_front) {
                    return Ok(value);
                }
                if let Some(reason) = &state.fault {
                    return Err(ProviderError::Listener(reason.clone()));
                }
                if state.peer_closed {
                    return Err(ProviderError::ConnectionClosed);
                }
            }
            notified.await;
        }
    }

    pub fn pending_notifications(&self, id: &SubscriptionId) -> usize {
        self.lock().subscriptions.get(id).map_or(0, VecDeque::len)
    }

    /// Number of requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .responses
            .values()
            .filter(|slot| matches!(slot, Slot::Waiting(_)))
            .count()
    }

    /// Number of parked responses nobody has claimed yet.
    pub fn cached_responses(&self) -> usize {
        self.lock()
            .responses
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// `true` if no response, waiter or subscription queue is held.
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.responses.is_empty() && state.subscriptions.is_empty()
    }

    /// Incremented by every [`clear_caches`](Self::clear_caches).
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn response(id: u64, result: &str) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "result": result})
    }

    fn push(sub: &str, n: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {"subscription": sub, "result": {"n": n}}
        })
    }

    #[test]
    fn parked_response_pops_exactly_once() {
        let p = RequestProcessor::new();
        p.cache_raw_response(response(1, "0x1"), false).unwrap();
        let key = CacheKey::from(&RpcId::Number(1));
        assert_eq!(p.pop_raw_response(&key).unwrap().result, Some(json!("0x1")));
        assert!(p.pop_raw_response(&key).is_none());
    }

    #[test]
    fn missing_key_is_not_an_error() {
        let p = RequestProcessor::new();
        assert!(p.pop_raw_response(&CacheKey::from(&RpcId::Number(9))).is_none());
    }

    #[test]
    fn duplicate_parked_response_is_rejected() {
        let p = RequestProcessor::new();
        p.cache_raw_response(response(5, "first"), false).unwrap();
        let err = p.cache_raw_response(response(5, "second"), false).unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateResponseId(RpcId::Number(5))));
        // the original entry survives
        let kept = p.pop_raw_response(&CacheKey::from(&RpcId::Number(5))).unwrap();
        assert_eq!(kept.result, Some(json!("first")));
    }

    #[tokio::test]
    async fn registered_waiter_is_resolved() {
        let p = RequestProcessor::new();
        let rx = p.register_request(&RpcId::Number(3)).unwrap();
        assert_eq!(p.in_flight(), 1);
        p.cache_raw_response(response(3, "0x3"), false).unwrap();
        assert_eq!(rx.await.unwrap().result, Some(json!("0x3")));
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn response_before_registration_is_delivered() {
        let p = RequestProcessor::new();
        p.cache_raw_response(response(4, "early"), false).unwrap();
        let rx = p.register_request(&RpcId::Number(4)).unwrap();
        assert_eq!(rx.await.unwrap().result, Some(json!("early")));
    }

    #[test]
    fn second_waiter_for_same_id_is_rejected() {
        let p = RequestProcessor::new();
        let _rx = p.register_request(&RpcId::from("abc")).unwrap();
        assert!(matches!(
            p.register_request(&RpcId::from("abc")),
            Err(ProviderError::DuplicateRequestId(_))
        ));
    }

    #[test]
    fn subscriptions_never_reach_the_response_cache() {
        let p = RequestProcessor::new();
        p.cache_raw_response(push("0xa", 1), true).unwrap();
        p.cache_raw_response(response(1, "0x1"), false).unwrap();
        p.cache_raw_response(push("0xa", 2), true).unwrap();

        assert_eq!(p.cached_responses(), 1);
        assert_eq!(p.pending_notifications(&"0xa".into()), 2);
        assert_eq!(p.pop_subscription(&"0xa".into()), Some(json!({"n": 1})));
        assert_eq!(p.pop_subscription(&"0xa".into()), Some(json!({"n": 2})));
        assert!(p.pop_subscription(&"0xa".into()).is_none());
    }

    #[test]
    fn message_without_id_or_method_is_invalid() {
        let p = RequestProcessor::new();
        let err = p.cache_raw_response(json!({"result": 1}), false).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn clear_empties_everything_and_fails_waiters() {
        let p = RequestProcessor::new();
        let rx = p.register_request(&RpcId::Number(1)).unwrap();
        p.cache_raw_response(response(2, "stale"), false).unwrap();
        p.cache_raw_response(push("0xa", 1), true).unwrap();

        p.clear_caches();

        assert!(p.is_empty());
        assert!(rx.await.is_err());
        assert!(matches!(p.closed_error(), ProviderError::ConnectionClosed));
        // a request made after the clear cannot pick up the stale response
        assert!(p.pop_raw_response(&CacheKey::from(&RpcId::Number(2))).is_none());
    }

    #[tokio::test]
    async fn fail_reports_listener_fault() {
        let p = RequestProcessor::new();
        let rx = p.register_request(&RpcId::Number(1)).unwrap();
        p.fail("decoder exploded");
        assert!(rx.await.is_err());
        assert!(matches!(p.closed_error(), ProviderError::Listener(r) if r == "decoder exploded"));
    }

    #[test]
    fn late_response_after_timeout_is_dropped() {
        let p = RequestProcessor::new();
        let _rx = p.register_request(&RpcId::Number(8)).unwrap();
        p.abandon_request(&RpcId::Number(8));
        p.cache_raw_response(response(8, "late"), false).unwrap();
        assert_eq!(p.cached_responses(), 0);
    }

    #[tokio::test]
    async fn next_subscription_waits_for_push() {
        let p = Arc::new(RequestProcessor::new());
        let reader = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.next_subscription(&"0xb".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.cache_raw_response(push("0xb", 7), true).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), json!({"n": 7}));
    }

    #[tokio::test]
    async fn next_subscription_fails_on_clear() {
        let p = Arc::new(RequestProcessor::new());
        let reader = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.next_subscription(&"0xb".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.clear_caches();
        assert!(matches!(
            reader.await.unwrap(),
            Err(ProviderError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn peer_close_wakes_subscription_readers_after_draining() {
        let p = Arc::new(RequestProcessor::new());
        p.cache_raw_response(push("0xc", 1), true).unwrap();
        let rx = p.register_request(&RpcId::Number(1)).unwrap();

        p.close_by_peer();
        assert!(p.is_peer_closed());
        assert!(rx.await.is_err());
        // queued data survives the close
        assert_eq!(p.next_subscription(&"0xc".into()).await.unwrap(), json!({"n": 1}));
        assert!(matches!(
            p.next_subscription(&"0xc".into()).await,
            Err(ProviderError::ConnectionClosed)
        ));

        p.reopen();
        assert!(!p.is_peer_closed());
    }

    #[tokio::test]
    async fn peer_close_interrupts_a_waiting_reader() {
        let p = Arc::new(RequestProcessor::new());
        let reader = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.next_subscription(&"0xd".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.close_by_peer();
        assert!(matches!(
            reader.await.unwrap(),
            Err(ProviderError::ConnectionClosed)
        ));
    }

    #[test]
    fn unclaimed_responses_are_bounded() {
        let p = RequestProcessor::new();
        for id in 0..MAX_PARKED_RESPONSES as u64 + 10 {
            p.cache_raw_response(response(id, "unsolicited"), false).unwrap();
        }
        assert_eq!(p.cached_responses(), MAX_PARKED_RESPONSES);
        // the oldest went first
        assert!(p.pop_raw_response(&CacheKey::from(&RpcId::Number(0))).is_none());
        assert!(p.pop_raw_response(&CacheKey::from(&RpcId::Number(10))).is_some());
    }

    #[test]
    fn abandoned_ids_are_bounded() {
        let p = RequestProcessor::new();
        for id in 0..MAX_ABANDONED_REQUESTS as u64 + 1 {
            let _rx = p.register_request(&RpcId::Number(id)).unwrap();
            p.abandon_request(&RpcId::Number(id));
        }
        // id 0 was forgotten, so its late response is parked instead of dropped
        p.cache_raw_response(response(0, "late"), false).unwrap();
        p.cache_raw_response(response(1, "late"), false).unwrap();
        assert_eq!(p.cached_responses(), 1);
        assert!(p.pop_raw_response(&CacheKey::from(&RpcId::Number(0))).is_some());
    }
}
