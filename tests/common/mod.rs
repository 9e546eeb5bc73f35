//! Shared fixtures for the integration tests: a scripted in-memory transport and a
//! scripted credential source.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};
use reqshield::{
    CredentialError, CredentialFuture, CredentialSource, Executor, ExecutorBuilder,
    IssuedCredential, ManualClock, Transport, TransportError, TransportErrorKind, TransportFuture,
    TransportRequest, TransportResponse,
};

pub const BASE_URL: &str = "https://api.example.test";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Clone, Debug)]
pub enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    },
    Fail(TransportErrorKind),
    Hang,
}

impl Step {
    pub fn status(status: u16) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn body(status: u16, body: impl Into<String>) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(self, name: &'static str, value: impl Into<String>) -> Self {
        match self {
            Self::Respond {
                status,
                mut headers,
                body,
            } => {
                headers.push((name, value.into()));
                Self::Respond {
                    status,
                    headers,
                    body,
                }
            }
            other => other,
        }
    }
}

/// Plays back `steps` in order, then repeats `fallback` forever.
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::new(Vec::new(), step)
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock recorded requests").len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("lock recorded requests").clone()
    }

    pub fn authorization_headers(&self) -> Vec<Option<String>> {
        self.requests()
            .iter()
            .map(|request| {
                request
                    .headers
                    .get(http::header::AUTHORIZATION)
                    .map(|value| value.to_str().expect("ascii header").to_owned())
            })
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture<'_> {
        self.requests
            .lock()
            .expect("lock recorded requests")
            .push(request);
        let step = self
            .steps
            .lock()
            .expect("lock scripted steps")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        Box::pin(async move {
            match step {
                Step::Respond {
                    status,
                    headers,
                    body,
                } => {
                    let mut header_map = HeaderMap::new();
                    for (name, value) in headers {
                        header_map.insert(
                            HeaderName::from_static(name),
                            HeaderValue::from_str(&value).expect("valid scripted header"),
                        );
                    }
                    Ok(TransportResponse::new(
                        StatusCode::from_u16(status).expect("valid scripted status"),
                        header_map,
                        body,
                    ))
                }
                Step::Fail(kind) => Err(TransportError::new(kind, "scripted transport failure")),
                Step::Hang => std::future::pending().await,
            }
        })
    }
}

/// Issues `prefix-1`, `prefix-2`, ... after `delay`, or fails every time once `failing`.
pub struct ScriptedTokens {
    prefix: &'static str,
    ttl: Duration,
    delay: Duration,
    issued: Arc<AtomicUsize>,
    failure: Option<CredentialError>,
}

impl ScriptedTokens {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            ttl: Duration::from_secs(3_600),
            delay: Duration::ZERO,
            issued: Arc::new(AtomicUsize::new(0)),
            failure: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, failure: CredentialError) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.issued)
    }
}

impl CredentialSource for ScriptedTokens {
    fn issue(&self) -> CredentialFuture {
        let call = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("{}-{call}", self.prefix);
        let ttl = self.ttl;
        let delay = self.delay;
        let failure = self.failure.clone();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match failure {
                Some(failure) => Err(failure),
                None => Ok(IssuedCredential::new(token, ttl)),
            }
        })
    }
}

pub fn builder(transport: Arc<ScriptedTransport>, clock: Arc<ManualClock>) -> ExecutorBuilder {
    init_tracing();
    Executor::builder(BASE_URL)
        .transport(transport)
        .clock(clock)
}
