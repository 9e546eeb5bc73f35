//! `reqshield` executes HTTP calls against one backend target behind a circuit breaker,
//! a bounded retry policy and a single-flight bearer credential cache.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use reqshield::prelude::{
//!     CircuitBreakerPolicy, Executor, HyperTransport, RequestSpec, RetryPolicy, TokenEndpoint,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Order {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(HyperTransport::new()?);
//!     let tokens = TokenEndpoint::new(transport.clone(), "https://auth.example.com/token")?
//!         .json_payload(&serde_json::json!({ "client_id": "orders-ui" }))?;
//!
//!     let executor = Executor::builder("https://api.example.com")
//!         .transport(transport)
//!         .credential_source(Arc::new(tokens))
//!         .circuit_breaker_policy(
//!             CircuitBreakerPolicy::standard()
//!                 .failure_threshold(5)
//!                 .recovery_timeout(Duration::from_secs(30)),
//!         )
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_retries(2)
//!                 .base_delay(Duration::from_millis(200))
//!                 .timeout_per_attempt(Duration::from_secs(5)),
//!         )
//!         .try_build()?;
//!
//!     let order: Order = executor.execute_json(RequestSpec::get("/v1/orders/42")).await?;
//!     println!("order id={}", order.id);
//!     Ok(())
//! }
//! ```
//!
//! # Outcome Rules
//!
//! - Timeouts, network errors, 5xx and 429 are retried and count toward the breaker once
//!   per logical call, after the retry budget is spent.
//! - Other 4xx responses fail immediately and never affect the breaker.
//! - A call refreshes its credential at most once. A 401 on a credential that was already
//!   cached triggers one refresh and one replay; a 401 on a credential fetched (or joined)
//!   for this very call is final. A final 401 fails the call with a token error and leaves
//!   the breaker untouched.
//! - Credential refreshes are bounded by
//!   [`ExecutorBuilder::credential_refresh_timeout`]; a stalled source fails every waiter
//!   with a token error.

mod circuit;
mod clock;
mod config;
mod credential;
mod error;
mod executor;
mod metrics;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::circuit::{CircuitBreaker, CircuitBreakerPolicy, CircuitPhase, CircuitStatus};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{ClientProfile, ResilienceConfig};
pub use crate::credential::{
    Credential, CredentialError, CredentialFuture, CredentialManager, CredentialSource,
    IssuedCredential, TokenEndpoint,
};
pub use crate::error::{AttemptFailure, Error, ErrorCode, TransportErrorKind};
pub use crate::executor::{Executor, ExecutorBuilder};
pub use crate::metrics::MetricsSnapshot;
pub use crate::request::RequestSpec;
pub use crate::response::Response;
pub use crate::retry::{AttemptOutcome, RetryPolicy};
pub use crate::transport::{
    HyperTransport, Transport, TransportError, TransportFuture, TransportRequest,
    TransportResponse,
};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AttemptFailure, CancellationToken, CircuitBreaker, CircuitBreakerPolicy, CircuitPhase,
        CircuitStatus, Credential, CredentialError, CredentialManager, CredentialSource, Error,
        ErrorCode, Executor, HyperTransport, IssuedCredential, MetricsSnapshot, RequestSpec,
        ResilienceConfig, Response, RetryPolicy, TokenEndpoint, Transport,
    };
}
