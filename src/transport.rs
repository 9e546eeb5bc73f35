use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::error::{BoxError, Error, TransportErrorKind};
use crate::util::classify_transport_error;

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind} transport error: {source}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// One request/response exchange, response body fully buffered.
///
/// Dropping the returned future must abort the exchange; the executor relies on this
/// to release the connection when an attempt times out or is cancelled.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> TransportFuture<'_>;
}

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default transport: hyper's pooled client over rustls (ring), HTTP/1.1 and HTTP/2.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    client: HyperClient,
}

impl HyperTransport {
    pub fn new() -> crate::Result<Self> {
        Self::with_pool(DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_IDLE_PER_HOST)
    }

    pub fn with_pool(
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> crate::Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| Error::TransportInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(https);
        Ok(Self { client })
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let TransportRequest {
                method,
                uri,
                headers,
                body,
            } = request;
            let mut http_request = Request::builder()
                .method(method)
                .uri(uri)
                .body(Full::new(body))
                .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
            *http_request.headers_mut() = headers;

            let response: Response<Incoming> =
                self.client.request(http_request).await.map_err(|source| {
                    let kind = classify_transport_error(&source);
                    TransportError::new(kind, source)
                })?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|source| TransportError::new(TransportErrorKind::Read, source))?
                .to_bytes();
            Ok(TransportResponse::new(parts.status, parts.headers, body))
        })
    }
}
