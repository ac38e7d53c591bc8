use std::sync::Mutex;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};
use sha2::{Digest, Sha256};

use crate::error::{Error, TransportErrorKind};

const MAX_ERROR_BODY_CHARS: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Later maps win on name collisions; every value of the winning map is kept.
pub(crate) fn merge_headers(base: &mut HeaderMap, overrides: &HeaderMap) {
    for name in overrides.keys() {
        base.remove(name);
    }
    for (name, value) in overrides {
        base.append(name.clone(), value.clone());
    }
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

fn has_http_scheme(text: &str) -> bool {
    let lower = text.get(..8).unwrap_or(text).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<(), Error> {
    if base_url.is_empty() {
        return Ok(());
    }
    let parsed = url::Url::parse(base_url).map_err(|_| Error::InvalidBaseUrl {
        base_url: base_url.to_owned(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::InvalidBaseUrl {
            base_url: base_url.to_owned(),
        });
    }
    Ok(())
}

pub(crate) fn base_url_host(base_url: &str) -> Option<String> {
    url::Url::parse(base_url)
        .ok()?
        .host_str()
        .map(|host| host.trim_matches(['[', ']']).to_ascii_lowercase())
}

pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<(String, Uri), Error> {
    let uri_text = if has_http_scheme(path) {
        path.to_owned()
    } else if path.contains("://") || base_url.is_empty() {
        return Err(Error::InvalidUri {
            uri: path.to_owned(),
        });
    } else {
        join_base_path(base_url, path)
    };
    let uri: Uri = uri_text.parse().map_err(|_| Error::InvalidUri {
        uri: uri_text.clone(),
    })?;
    if uri.host().is_none() {
        return Err(Error::InvalidUri { uri: uri_text });
    }
    Ok((uri_text, uri))
}

/// Appends `pairs` to the query of `path`, keeping any existing query and
/// fragment in place.
pub(crate) fn append_query_pairs(path: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return path.to_owned();
    }

    let (target, fragment) = match path.split_once('#') {
        Some((target, fragment)) => (target, Some(fragment)),
        None => (path, None),
    };
    let separator = match target.rfind('?') {
        None => "?",
        Some(index) if index + 1 == target.len() || target.ends_with('&') => "",
        Some(_) => "&",
    };

    let mut merged = format!("{target}{separator}{}", encode_form_pairs(pairs));
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

pub(crate) fn encode_form_pairs(pairs: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Sorts a hyper client failure into the kinds the offline classifier cares
/// about, by inspecting the whole source chain.
pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let mut detail = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        detail.push(' ');
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    let detail = detail.to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|needle| detail.contains(needle));

    if error.is_connect() {
        if mentions(&["dns", "lookup", "name or service not known"]) {
            TransportErrorKind::Dns
        } else if mentions(&["certificate", "tls", "handshake"]) {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if mentions(&["connection reset", "connection closed", "broken pipe", "eof"]) {
        TransportErrorKind::Read
    } else {
        TransportErrorKind::Other
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.is_empty() || path.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
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

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.into_owned(),
    }
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = String::with_capacity(digest.len() * 2);
    for byte in digest {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}
