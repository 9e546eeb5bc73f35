use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::Result;
use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

/// One logical call: what to send, independent of how many attempts it takes.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    authenticated: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            authenticated: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Overrides the executor's per-attempt timeout for this call only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Sends the call without an `Authorization` header and skips credential handling.
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}
