//! Connection facade: lazy connect, scoped connections and reconnecting loops.
//!
//! ```ignore
//! // connect now, keep the provider
//! let provider = PersistentConnection::new(provider).await?;
//!
//! // connect, run, always disconnect
//! conn.with_connection(|p| Box::pin(async move { p.call::<String>("eth_chainId", vec![]).await })).await?;
//!
//! // reconnect whenever the body hits a connection error
//! conn.run(|p| Box::pin(async move { ... Ok(ControlFlow::Continue(())) })).await?;
//! ```

use std::future::IntoFuture;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, Stream};

use crate::error::ProviderError;
use crate::provider::PersistentProvider;
use crate::transport::SocketConnector;

/// Wraps a provider that has not been connected yet.
pub struct PersistentConnection<C: SocketConnector> {
    provider: PersistentProvider<C>,
}

impl<C: SocketConnector> PersistentConnection<C> {
    pub fn new(provider: PersistentProvider<C>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &PersistentProvider<C> {
        &self.provider
    }

    pub fn into_provider(self) -> PersistentProvider<C> {
        self.provider
    }

    /// Connect, run `f`, then disconnect whether `f` succeeded, failed or panicked.
    ///
    /// A panic in `f` is re-raised after the disconnect. Dropping the returned
    /// future before it completes skips the disconnect; the socket then stays
    /// open until [`PersistentProvider::disconnect`] is called or the provider
    /// is dropped.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, ProviderError>
    where
        F: for<'a> FnOnce(&'a PersistentProvider<C>) -> BoxFuture<'a, Result<T, ProviderError>>,
    {
        self.provider.connect().await?;
        let outcome = AssertUnwindSafe(f(&self.provider)).catch_unwind().await;
        self.provider.disconnect().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// One connected provider per step, reconnecting first whenever needed.
    ///
    /// Ends after yielding the error once connection retries are exhausted.
    /// The stream is not `Unpin`; pin it before polling.
    pub fn connections(&self) -> impl Stream<Item = Result<&PersistentProvider<C>, ProviderError>> + '_ {
        stream::unfold(true, move |running| async move {
            if !running {
                return None;
            }
            match self.provider.ensure_connected().await {
                Ok(()) => Some((Ok(&self.provider), true)),
                Err(e) => Some((Err(e), false)),
            }
        })
    }

    /// Run `body` repeatedly over a connection kept alive between steps.
    ///
    /// A connection-class error tears the socket down and the next step
    /// reconnects. A transient error moves on to the next step. Anything else,
    /// including exhausted connection retries, ends the loop.
    pub async fn run<T, F>(&self, mut body: F) -> Result<T, ProviderError>
    where
        F: for<'a> FnMut(&'a PersistentProvider<C>) -> BoxFuture<'a, Result<ControlFlow<T>, ProviderError>>,
    {
        loop {
            self.provider.ensure_connected().await?;
            match body(&self.provider).await {
                Ok(ControlFlow::Break(value)) => return Ok(value),
                Ok(ControlFlow::Continue(())) => {}
                Err(e) if e.is_connection_error() => {
                    tracing::warn!(endpoint = %self.provider.endpoint(), error = %e, "connection lost, reconnecting");
                    self.provider.disconnect().await;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(endpoint = %self.provider.endpoint(), error = %e, "step failed");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Awaiting the facade connects and hands back the live provider.
impl<C: SocketConnector> IntoFuture for PersistentConnection<C> {
    type Output = Result<PersistentProvider<C>, ProviderError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.provider.connect().await?;
            Ok(self.provider)
        })
    }
}
