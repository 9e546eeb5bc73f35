use std::error::Error as StdError;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Uri};

use crate::error::{Error, TransportErrorKind};

const MAX_ERROR_BODY_CHARS: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Request headers replace default headers of the same name.
pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    merged.extend(request_headers.clone());
    merged
}

/// Scheme, host, port and path only; userinfo, query and fragment can carry secrets.
pub(crate) fn redact_uri_for_logs(uri: &Uri) -> String {
    let Some(authority) = uri.authority() else {
        return uri.path().to_owned();
    };
    let scheme = uri.scheme_str().unwrap_or("http");
    match authority.port_u16() {
        Some(port) => format!("{scheme}://{}:{port}{}", authority.host(), uri.path()),
        None => format!("{scheme}://{}{}", authority.host(), uri.path()),
    }
}

/// Accepts only absolute http(s) URLs without userinfo, query, fragment or stray whitespace.
pub(crate) fn validate_base_url(base_url: &str) -> Result<(), Error> {
    let acceptable = base_url.trim() == base_url
        && url::Url::parse(base_url).is_ok_and(|parsed| {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some()
                && parsed.username().is_empty()
                && parsed.password().is_none()
                && parsed.query().is_none()
                && parsed.fragment().is_none()
        });
    if acceptable {
        Ok(())
    } else {
        Err(Error::InvalidUri {
            uri: base_url.to_owned(),
        })
    }
}

/// Absolute http(s) paths are used as given; anything else is joined onto the base URL.
pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<Uri, Error> {
    let invalid = |uri: &str| Error::InvalidUri {
        uri: uri.to_owned(),
    };
    if let Ok(uri) = path.parse::<Uri>()
        && uri.host().is_some()
    {
        let is_http = uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"));
        return if is_http { Ok(uri) } else { Err(invalid(path)) };
    }
    let joined = join_base_path(base_url, path);
    joined.parse().map_err(|_| invalid(&joined))
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match path.trim_start_matches('/') {
        "" => base.to_owned(),
        relative => format!("{base}/{relative}"),
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn bearer_header_value(token: &str) -> Result<HeaderValue, Error> {
    let mut value = parse_header_value("authorization", &format!("Bearer {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Delta-seconds or an HTTP date; a date in the past means "retry now".
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    match raw.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => httpdate::parse_http_date(raw)
            .ok()
            .map(|at| at.duration_since(now).unwrap_or_default()),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.into_owned(),
    }
}

/// Maps a hyper client failure onto a [`TransportErrorKind`] by walking its cause chain.
pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let mut cause = StdError::source(error);
    while let Some(current) = cause {
        if current.is::<rustls::Error>() {
            return TransportErrorKind::Tls;
        }
        if let Some(io_error) = current.downcast_ref::<io::Error>() {
            if io_error
                .get_ref()
                .is_some_and(|inner| inner.is::<rustls::Error>())
            {
                return TransportErrorKind::Tls;
            }
            match io_error.kind() {
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::HostUnreachable => return TransportErrorKind::Connect,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return TransportErrorKind::Read,
                _ => {}
            }
        }
        if let Some(hyper_error) = current.downcast_ref::<hyper::Error>()
            && hyper_error.is_incomplete_message()
        {
            return TransportErrorKind::Read;
        }
        // hyper-util tags resolver failures with this prefix and keeps the type private.
        if error.is_connect() && current.to_string().starts_with("dns error") {
            return TransportErrorKind::Dns;
        }
        cause = current.source();
    }

    if error.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    }
}
