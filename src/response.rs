use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::util::truncate_body;

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    attempts: usize,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes, attempts: usize) -> Self {
        Self {
            status,
            headers,
            body,
            attempts,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Network attempts the logical call took, including a replay after credential refresh.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}
