use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::header::{AUTHORIZATION, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::Result;
use crate::circuit::{CircuitBreaker, CircuitBreakerPolicy, CircuitPermit, CircuitStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::credential::{
    CredentialError, CredentialLease, CredentialManager, CredentialSource,
    DEFAULT_REFRESH_TIMEOUT, DEFAULT_SAFETY_MARGIN,
};
use crate::error::{AttemptFailure, Error};
use crate::metrics::{ExecutorMetrics, MetricsSnapshot};
use crate::request::RequestSpec;
use crate::response::Response;
use crate::retry::{AttemptOutcome, RetryPolicy};
use crate::transport::{HyperTransport, Transport, TransportRequest};
use crate::util::{
    bearer_header_value, merge_headers, parse_header_name, parse_header_value, parse_retry_after,
    redact_uri_for_logs, resolve_uri, truncate_body, validate_base_url,
};

const DEFAULT_CLIENT_NAME: &str = concat!("reqshield/", env!("CARGO_PKG_VERSION"));

pub struct ExecutorBuilder {
    base_url: String,
    default_headers: HeaderMap,
    client_name: String,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    circuit_breaker_policy: CircuitBreakerPolicy,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    credential_source: Option<Arc<dyn CredentialSource>>,
    credential_manager: Option<Arc<CredentialManager>>,
    credential_safety_margin: Duration,
    credential_refresh_timeout: Duration,
}

impl ExecutorBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transport: None,
            clock: Arc::new(SystemClock),
            retry_policy: RetryPolicy::standard(),
            circuit_breaker_policy: CircuitBreakerPolicy::standard(),
            circuit_breaker: None,
            credential_source: None,
            credential_manager: None,
            credential_safety_margin: DEFAULT_SAFETY_MARGIN,
            credential_refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Time source for the breaker and credential manager built by this builder.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn circuit_breaker_policy(mut self, circuit_breaker_policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker_policy = circuit_breaker_policy;
        self
    }

    /// Shares an existing breaker, e.g. between executors talking to the same backend.
    pub fn circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn credential_source(mut self, credential_source: Arc<dyn CredentialSource>) -> Self {
        self.credential_source = Some(credential_source);
        self
    }

    pub fn credential_manager(mut self, credential_manager: Arc<CredentialManager>) -> Self {
        self.credential_manager = Some(credential_manager);
        self
    }

    pub fn credential_safety_margin(mut self, credential_safety_margin: Duration) -> Self {
        self.credential_safety_margin = credential_safety_margin;
        self
    }

    /// Bounds each call to the credential source; callers waiting on a stalled
    /// refresh fail with a token error instead of hanging.
    pub fn credential_refresh_timeout(mut self, credential_refresh_timeout: Duration) -> Self {
        self.credential_refresh_timeout = credential_refresh_timeout;
        self
    }

    pub fn config(self, config: &ResilienceConfig) -> Self {
        self.retry_policy(config.retry_policy())
            .circuit_breaker_policy(config.circuit_breaker_policy())
            .credential_safety_margin(config.credential_safety_margin())
            .credential_refresh_timeout(config.credential_refresh_timeout())
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn try_build(self) -> Result<Executor> {
        validate_base_url(&self.base_url)?;

        let mut default_headers = self.default_headers;
        if !default_headers.contains_key(USER_AGENT) {
            let user_agent = parse_header_value(USER_AGENT.as_str(), &self.client_name)?;
            default_headers.insert(USER_AGENT, user_agent);
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        let breaker = self.circuit_breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::with_clock(
                self.circuit_breaker_policy,
                Arc::clone(&self.clock),
            ))
        });
        let credentials = match (self.credential_manager, self.credential_source) {
            (Some(manager), _) => Some(manager),
            (None, Some(source)) => Some(Arc::new(
                CredentialManager::new(source)
                    .clock(Arc::clone(&self.clock))
                    .safety_margin(self.credential_safety_margin)
                    .refresh_timeout(self.credential_refresh_timeout),
            )),
            (None, None) => None,
        };

        Ok(Executor {
            base_url: self.base_url,
            default_headers,
            client_name: self.client_name,
            transport,
            breaker,
            credentials,
            retry_policy: self.retry_policy,
            metrics: ExecutorMetrics::default(),
        })
    }
}

/// The entry point callers use for every call to one backend target.
///
/// Cheap to clone; clones share the breaker, credential cache, transport and metrics.
#[derive(Clone)]
pub struct Executor {
    base_url: String,
    default_headers: HeaderMap,
    client_name: String,
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    credentials: Option<Arc<CredentialManager>>,
    retry_policy: RetryPolicy,
    metrics: ExecutorMetrics,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Executor")
            .field("base_url", &self.base_url)
            .field("client_name", &self.client_name)
            .field("retry_policy", &self.retry_policy)
            .field("breaker", &self.breaker)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl Executor {
    pub fn builder(base_url: impl Into<String>) -> ExecutorBuilder {
        ExecutorBuilder::new(base_url)
    }

    pub fn status(&self) -> CircuitStatus {
        self.breaker.status()
    }

    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn credential_manager(&self) -> Option<&Arc<CredentialManager>> {
        self.credentials.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let refreshes = self
            .credentials
            .as_ref()
            .map_or(0, |manager| manager.refresh_count());
        self.metrics.snapshot(refreshes)
    }

    pub async fn execute(&self, spec: RequestSpec) -> Result<Response> {
        self.execute_with_cancel(spec, CancellationToken::new()).await
    }

    pub async fn execute_json<T>(&self, spec: RequestSpec) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.execute(spec).await?.json()
    }

    /// Like [`execute`](Self::execute), but `cancel` aborts the in-flight attempt, backoff
    /// or credential wait and yields [`Error::Aborted`] without touching breaker health.
    pub async fn execute_with_cancel(
        &self,
        spec: RequestSpec,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let uri = resolve_uri(&self.base_url, spec.path())?;
        let redacted_uri_text = redact_uri_for_logs(&uri);
        let span = info_span!(
            "reqshield.call",
            client = %self.client_name,
            method = %spec.method(),
            uri = %redacted_uri_text,
            max_attempts = self.retry_policy.max_attempts()
        );

        let _in_flight = self.metrics.enter_call();
        let started = Instant::now();
        let result = async {
            let result = self
                .run_call(&spec, uri, &redacted_uri_text, &cancel)
                .await;
            match &result {
                Ok(response) => debug!(
                    status = response.status().as_u16(),
                    attempts = response.attempts(),
                    "call completed"
                ),
                Err(error) => debug!(code = error.code().as_str(), error = %error, "call failed"),
            }
            result
        }
        .instrument(span)
        .await;
        self.metrics.record_call_completed(&result, started.elapsed());
        result
    }

    async fn run_call(
        &self,
        spec: &RequestSpec,
        uri: Uri,
        redacted_uri_text: &str,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let method = spec.method().clone();
        let permit = match CircuitPermit::acquire(&self.breaker) {
            Ok(permit) => permit,
            Err(retry_after) => {
                debug!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "circuit open; call rejected"
                );
                return Err(Error::CircuitOpen {
                    method,
                    uri: redacted_uri_text.to_owned(),
                    retry_after_ms: retry_after.as_millis(),
                });
            }
        };
        if permit.is_probe() {
            debug!("call admitted as half-open probe");
        }

        let credentials = self
            .credentials
            .as_ref()
            .filter(|_| spec.is_authenticated());
        let mut lease = match credentials {
            Some(manager) => {
                let acquired = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(aborted(0, &method, redacted_uri_text));
                    }
                    acquired = manager.acquire() => acquired,
                };
                Some(acquired.map_err(|source| token_error(source, &method, redacted_uri_text))?)
            }
            None => None,
        };
        let mut refreshed = lease.as_ref().is_some_and(|lease| lease.refreshed);

        let headers = merge_headers(&self.default_headers, spec.headers());
        let body = spec.body_bytes().cloned().unwrap_or_default();
        let attempt_timeout = spec
            .attempt_timeout()
            .unwrap_or_else(|| self.retry_policy.configured_timeout_per_attempt());
        let mut attempt_index = 0_usize;
        let mut attempts_sent = 0_usize;

        loop {
            let mut request_headers = headers.clone();
            if let Some(lease) = &lease {
                let authorization = bearer_header_value(lease.credential.token())?;
                request_headers.insert(AUTHORIZATION, authorization);
            }
            let request = TransportRequest {
                method: method.clone(),
                uri: uri.clone(),
                headers: request_headers,
                body: body.clone(),
            };

            attempts_sent += 1;
            self.metrics.record_attempt();
            debug!(attempt = attempt_index + 1, "sending attempt");
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(aborted(attempts_sent, &method, redacted_uri_text));
                }
                sent = timeout(attempt_timeout, self.transport.send(request)) => sent,
            };

            let (outcome, failure, retry_after) = match sent {
                Ok(Ok(response)) => {
                    let status = response.status;
                    if status.is_success() {
                        permit.succeed();
                        return Ok(Response::new(
                            status,
                            response.headers,
                            response.body,
                            attempts_sent,
                        ));
                    }

                    if status == StatusCode::UNAUTHORIZED
                        && let (Some(manager), Some(current)) = (credentials, &lease)
                    {
                        if refreshed {
                            warn!("refreshed credential rejected by backend");
                            return Err(token_error(
                                CredentialError::Rejected,
                                &method,
                                redacted_uri_text,
                            ));
                        }
                        info!("credential rejected; refreshing before replay");
                        let renewed = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return Err(aborted(attempts_sent, &method, redacted_uri_text));
                            }
                            renewed = manager.refresh_after_rejection(&current.credential) => renewed,
                        };
                        let credential = renewed
                            .map_err(|source| token_error(source, &method, redacted_uri_text))?;
                        lease = Some(CredentialLease {
                            credential,
                            refreshed: true,
                        });
                        refreshed = true;
                        continue;
                    }

                    let outcome = AttemptOutcome::from_status(status);
                    let body = truncate_body(&response.body);
                    if !outcome.is_infrastructure_failure() {
                        return Err(status_error(status, method, redacted_uri_text, body));
                    }

                    let retry_after = parse_retry_after(&response.headers, SystemTime::now());
                    let failure = if status == StatusCode::TOO_MANY_REQUESTS {
                        AttemptFailure::RateLimited {
                            retry_after_ms: retry_after.map(|delay| delay.as_millis()),
                            body,
                        }
                    } else {
                        AttemptFailure::Server {
                            status: status.as_u16(),
                            body,
                        }
                    };
                    (outcome, failure, retry_after)
                }
                Ok(Err(error)) => (
                    AttemptOutcome::NetworkError(error.kind),
                    AttemptFailure::Network {
                        kind: error.kind,
                        message: error.source.to_string(),
                    },
                    None,
                ),
                Err(_) => (
                    AttemptOutcome::Timeout,
                    AttemptFailure::Timeout {
                        timeout_ms: attempt_timeout.as_millis(),
                    },
                    None,
                ),
            };

            if !self.retry_policy.should_retry(attempt_index, &outcome) {
                warn!(
                    attempts = attempt_index + 1,
                    error = %failure,
                    "retries exhausted"
                );
                permit.fail();
                return Err(Error::RetriesExhausted {
                    attempts: attempt_index + 1,
                    method,
                    uri: redacted_uri_text.to_owned(),
                    last: failure,
                });
            }

            let retry_delay = self
                .retry_policy
                .delay_with_retry_after(attempt_index, retry_after);
            warn!(
                attempt = attempt_index + 1,
                delay_ms = retry_delay.as_millis() as u64,
                error = %failure,
                "retrying call"
            );
            self.metrics.record_retry();
            if !retry_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(aborted(attempts_sent, &method, redacted_uri_text));
                    }
                    _ = sleep(retry_delay) => {}
                }
            }
            attempt_index += 1;
        }
    }
}

fn aborted(attempts: usize, method: &Method, uri: &str) -> Error {
    Error::Aborted {
        attempts,
        method: method.clone(),
        uri: uri.to_owned(),
    }
}

fn token_error(source: CredentialError, method: &Method, uri: &str) -> Error {
    Error::Token {
        method: method.clone(),
        uri: uri.to_owned(),
        source,
    }
}

fn status_error(status: StatusCode, method: Method, uri: &str, body: String) -> Error {
    if status.is_client_error() {
        Error::Client {
            status: status.as_u16(),
            method,
            uri: uri.to_owned(),
            body,
        }
    } else {
        Error::UnexpectedStatus {
            status: status.as_u16(),
            method,
            uri: uri.to_owned(),
            body,
        }
    }
}
