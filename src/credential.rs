//! Bearer credential lifecycle.
//!
//! A [`CredentialManager`] caches one credential for a backend target and refreshes it
//! through a [`CredentialSource`] when it is missing, close to expiry, or rejected by the
//! backend. Refreshes are single-flight: while one is running, every other caller awaits
//! the same future and observes the same credential or the same error.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::TransportErrorKind;
use crate::transport::{Transport, TransportRequest};
use crate::util::{lock_unpoisoned, truncate_body};

pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Usable only while `now < expires_at - safety_margin`.
    pub fn is_usable_at(&self, now: Instant, safety_margin: Duration) -> bool {
        match self.expires_at.checked_sub(safety_margin) {
            Some(usable_until) => now < usable_until,
            None => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What the issuing endpoint hands back: a token and how long it stays valid.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub token: String,
    pub expires_in: Duration,
}

impl IssuedCredential {
    pub fn new(token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            token: token.into(),
            expires_in,
        }
    }
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("IssuedCredential")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CredentialError {
    #[error("credential endpoint unreachable ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("credential endpoint timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("credential endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("credential endpoint returned a malformed response: {message}")]
    Malformed { message: String },
    #[error("credential rejected by backend after refresh")]
    Rejected,
    #[error("credential refresh failed: {message}")]
    Other { message: String },
}

pub type CredentialFuture =
    Pin<Box<dyn Future<Output = Result<IssuedCredential, CredentialError>> + Send + 'static>>;

/// The external token-issuing collaborator.
///
/// The returned future must be `'static`: it can outlive the caller that started the
/// refresh, since late joiners keep awaiting it.
pub trait CredentialSource: Send + Sync {
    fn issue(&self) -> CredentialFuture;
}

impl<F, Fut> CredentialSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<IssuedCredential, CredentialError>> + Send + 'static,
{
    fn issue(&self) -> CredentialFuture {
        Box::pin(self())
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, CredentialError>>>;

#[derive(Default)]
struct CredentialState {
    current: Option<Credential>,
    in_flight: Option<SharedRefresh>,
}

pub(crate) struct CredentialLease {
    pub(crate) credential: Credential,
    pub(crate) refreshed: bool,
}

pub struct CredentialManager {
    source: Arc<dyn CredentialSource>,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    refresh_timeout: Duration,
    state: Arc<Mutex<CredentialState>>,
    refreshes: Arc<AtomicU64>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        formatter
            .debug_struct("CredentialManager")
            .field("safety_margin", &self.safety_margin)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("current", &state.current)
            .field("refresh_in_flight", &state.in_flight.is_some())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

impl CredentialManager {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            clock: Arc::new(SystemClock),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            state: Arc::new(Mutex::new(CredentialState::default())),
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    /// Upper bound on one call to the credential source. Every caller waiting on a
    /// refresh that overruns it fails with [`CredentialError::Timeout`].
    pub fn refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout.max(Duration::from_millis(1));
        self
    }

    /// Seeds the cache, e.g. with a credential restored from persisted storage.
    pub fn with_credential(self, credential: Credential) -> Self {
        lock_unpoisoned(&self.state).current = Some(credential);
        self
    }

    pub fn configured_safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn configured_refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// Number of refreshes issued to the credential source so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn cached(&self) -> Option<Credential> {
        lock_unpoisoned(&self.state).current.clone()
    }

    pub fn invalidate(&self) {
        lock_unpoisoned(&self.state).current = None;
    }

    pub async fn get_valid_credential(&self) -> Result<Credential, CredentialError> {
        self.acquire().await.map(|lease| lease.credential)
    }

    pub(crate) async fn acquire(&self) -> Result<CredentialLease, CredentialError> {
        let refresh = {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(current) = &state.current
                && current.is_usable_at(self.clock.now(), self.safety_margin)
            {
                return Ok(CredentialLease {
                    credential: current.clone(),
                    refreshed: false,
                });
            }
            self.refresh_or_join(&mut state)
        };
        let credential = refresh.await?;
        Ok(CredentialLease {
            credential,
            refreshed: true,
        })
    }

    /// Refreshes after the backend rejected `stale`.
    ///
    /// If the cache already holds a different usable credential, another caller has
    /// rotated it in the meantime and that credential is returned without a new refresh.
    pub async fn refresh_after_rejection(
        &self,
        stale: &Credential,
    ) -> Result<Credential, CredentialError> {
        let refresh = {
            let mut state = lock_unpoisoned(&self.state);
            if state.in_flight.is_none()
                && let Some(current) = &state.current
                && current.token != stale.token
                && current.is_usable_at(self.clock.now(), self.safety_margin)
            {
                return Ok(current.clone());
            }
            self.refresh_or_join(&mut state)
        };
        refresh.await
    }

    fn refresh_or_join(&self, state: &mut CredentialState) -> SharedRefresh {
        if let Some(in_flight) = &state.in_flight {
            debug!("joining in-flight credential refresh");
            return in_flight.clone();
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let source = Arc::clone(&self.source);
        let clock = Arc::clone(&self.clock);
        let shared_state = Arc::clone(&self.state);
        let limit = self.refresh_timeout;
        let refresh = async move {
            let issued = AssertUnwindSafe(async { timeout(limit, source.issue()).await })
                .catch_unwind()
                .await;
            let result = match issued {
                Ok(Ok(Ok(issued))) => expiring_credential(issued, clock.now()),
                Ok(Ok(Err(error))) => Err(error),
                Ok(Err(_)) => Err(CredentialError::Timeout {
                    timeout_ms: limit.as_millis(),
                }),
                Err(_) => Err(CredentialError::Other {
                    message: "credential source panicked".to_owned(),
                }),
            };

            let finished = {
                let mut state = lock_unpoisoned(&shared_state);
                match &result {
                    Ok(credential) => {
                        info!(
                            expires_in_ms = credential
                                .expires_at()
                                .saturating_duration_since(clock.now())
                                .as_millis() as u64,
                            "credential refreshed"
                        );
                        state.current = Some(credential.clone());
                    }
                    Err(error) => {
                        warn!(error = %error, "credential refresh failed; cache cleared");
                        state.current = None;
                    }
                }
                state.in_flight.take()
            };
            drop(finished);
            result
        }
        .boxed()
        .shared();

        state.in_flight = Some(refresh.clone());
        refresh
    }
}

fn expiring_credential(
    issued: IssuedCredential,
    now: Instant,
) -> Result<Credential, CredentialError> {
    let expires_at = now
        .checked_add(issued.expires_in)
        .ok_or_else(|| CredentialError::Malformed {
            message: format!(
                "lifetime of {}s is out of range",
                issued.expires_in.as_secs()
            ),
        })?;
    Ok(Credential::new(issued.token, expires_at))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "token")]
    access_token: String,
    expires_in: u64,
}

/// A [`CredentialSource`] that exchanges a fixed payload for a token over HTTP.
///
/// The request goes straight to the transport: it is never gated by, nor recorded on,
/// the backend's circuit breaker. Expects a JSON body with `access_token` (or `token`)
/// and `expires_in` seconds.
#[derive(Clone)]
pub struct TokenEndpoint {
    transport: Arc<dyn Transport>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    payload: Bytes,
    timeout: Duration,
}

impl TokenEndpoint {
    pub fn new(transport: Arc<dyn Transport>, url: &str) -> crate::Result<Self> {
        crate::util::validate_base_url(url)?;
        let uri = url.parse().map_err(|_| crate::Error::InvalidUri {
            uri: url.to_owned(),
        })?;
        Ok(Self {
            transport,
            method: Method::POST,
            uri,
            headers: HeaderMap::new(),
            payload: Bytes::new(),
            timeout: DEFAULT_TOKEN_TIMEOUT,
        })
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json_payload<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| crate::Error::Serialize { source })?;
        self.payload = Bytes::from(body);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

impl CredentialSource for TokenEndpoint {
    fn issue(&self) -> CredentialFuture {
        let transport = Arc::clone(&self.transport);
        let request = TransportRequest {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.payload.clone(),
        };
        let limit = self.timeout;
        Box::pin(async move {
            let response = match timeout(limit, transport.send(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    return Err(CredentialError::Transport {
                        kind: error.kind,
                        message: error.source.to_string(),
                    });
                }
                Err(_) => {
                    return Err(CredentialError::Timeout {
                        timeout_ms: limit.as_millis(),
                    });
                }
            };
            if !response.status.is_success() {
                return Err(CredentialError::Status {
                    status: response.status.as_u16(),
                    body: truncate_body(&response.body),
                });
            }
            let parsed: TokenResponse =
                serde_json::from_slice(&response.body).map_err(|source| {
                    CredentialError::Malformed {
                        message: source.to_string(),
                    }
                })?;
            Ok(IssuedCredential::new(
                parsed.access_token,
                Duration::from_secs(parsed.expires_in),
            ))
        })
    }
}
