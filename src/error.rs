use http::Method;
use thiserror::Error;

use crate::credential::CredentialError;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// The transient failure observed on the last attempt of a logical call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptFailure {
    Timeout {
        timeout_ms: u128,
    },
    Network {
        kind: TransportErrorKind,
        message: String,
    },
    Server {
        status: u16,
        body: String,
    },
    RateLimited {
        retry_after_ms: Option<u128>,
        body: String,
    },
}

impl AttemptFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Timeout { .. } | Self::Network { .. } => None,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { timeout_ms } => write!(formatter, "attempt timed out after {timeout_ms}ms"),
            Self::Network { kind, message } => {
                write!(formatter, "network error ({kind}): {message}")
            }
            Self::Server { status, body } => write!(formatter, "server error {status}: {body}"),
            Self::RateLimited {
                retry_after_ms: Some(retry_after_ms),
                body,
            } => write!(
                formatter,
                "rate limited (retry after {retry_after_ms}ms): {body}"
            ),
            Self::RateLimited {
                retry_after_ms: None,
                body,
            } => write!(formatter, "rate limited: {body}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    Deserialize,
    TransportInit,
    CircuitOpen,
    Client,
    UnexpectedStatus,
    Token,
    RetriesExhausted,
    Aborted,
}

impl ErrorCode {
    pub const fn all() -> &'static [Self] {
        &[
            Self::InvalidUri,
            Self::InvalidHeaderName,
            Self::InvalidHeaderValue,
            Self::SerializeJson,
            Self::Deserialize,
            Self::TransportInit,
            Self::CircuitOpen,
            Self::Client,
            Self::UnexpectedStatus,
            Self::Token,
            Self::RetriesExhausted,
            Self::Aborted,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::Deserialize => "deserialize",
            Self::TransportInit => "transport_init",
            Self::CircuitOpen => "circuit_open",
            Self::Client => "client",
            Self::UnexpectedStatus => "unexpected_status",
            Self::Token => "token",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to initialize http transport: {message}")]
    TransportInit { message: String },
    #[error("circuit breaker is open for {method} {uri}; retry after {retry_after_ms}ms")]
    CircuitOpen {
        method: Method,
        uri: String,
        retry_after_ms: u128,
    },
    #[error("client error {status} for {method} {uri}: {body}")]
    Client {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("unexpected status {status} for {method} {uri}: {body}")]
    UnexpectedStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("credential error for {method} {uri}: {source}")]
    Token {
        method: Method,
        uri: String,
        #[source]
        source: CredentialError,
    },
    #[error("service unreachable after {attempts} attempts for {method} {uri}: {last}")]
    RetriesExhausted {
        attempts: usize,
        method: Method,
        uri: String,
        last: AttemptFailure,
    },
    #[error("request aborted after {attempts} attempts for {method} {uri}")]
    Aborted {
        attempts: usize,
        method: Method,
        uri: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::TransportInit { .. } => ErrorCode::TransportInit,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Client { .. } => ErrorCode::Client,
            Self::UnexpectedStatus { .. } => ErrorCode::UnexpectedStatus,
            Self::Token { .. } => ErrorCode::Token,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::Aborted { .. } => ErrorCode::Aborted,
        }
    }

    /// Caller-facing wording for the failure, independent of transport details.
    pub fn user_message(&self) -> String {
        match self {
            Self::CircuitOpen { .. } => "service temporarily unavailable, retry later".to_owned(),
            Self::Client { .. }
            | Self::InvalidUri { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::Serialize { .. } => "request invalid".to_owned(),
            Self::RetriesExhausted { attempts, .. } => {
                format!("service unreachable after {attempts} attempts")
            }
            Self::Token { .. } => "authentication failed, sign in again".to_owned(),
            Self::Aborted { .. } => "request cancelled".to_owned(),
            Self::Deserialize { .. } | Self::UnexpectedStatus { .. } => {
                "service returned an unexpected response".to_owned()
            }
            Self::TransportInit { .. } => "client is misconfigured".to_owned(),
        }
    }

    /// True for failures that mean the backend could not be reached or was unhealthy.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::CircuitOpen { .. })
    }
}
