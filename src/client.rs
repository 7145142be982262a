//! Exchange API capability interface
//!
//! The manager never speaks an exchange wire protocol itself. Each configured
//! endpoint supplies an opaque client implementing [`ExchangeApi`]; the only
//! contract the manager relies on is the typed error classification below.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Typed errors an exchange client must distinguish
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The exchange itself rejected the call for rate-limit reasons
    #[error("rate limited by exchange")]
    RateLimited { retry_after: Option<Duration> },

    /// The call did not complete within the given timeout
    #[error("request timed out")]
    Timeout,

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure (connect, TLS, reset)
    #[error("transport error: {0}")]
    Transport(String),

    /// Anything else the client cannot classify
    #[error("exchange error: {0}")]
    Other(String),
}

/// Capability handle for one exchange integration.
///
/// `call` must honor the supplied timeout; the orchestrator additionally bounds
/// the future on its side, so a misbehaving client cannot hold a connection
/// past the request deadline.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Perform one API call against the exchange.
    async fn call(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, CallError>;

    /// Cheap liveness probe used by the health monitor.
    ///
    /// Defaults to a `ping` call with null params; clients with a dedicated
    /// status endpoint should override this.
    async fn ping(&self, timeout: Duration) -> Result<(), CallError> {
        self.call("ping", &Value::Null, timeout).await.map(|_| ())
    }
}
