use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;

use crate::descriptor::RequestDescriptor;
use crate::error::{Error, TransportErrorKind};
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value};

/// Canned response returned by a simulated operation.
#[derive(Clone, Debug)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    delay: Duration,
}

impl MockResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Simulated latency before the response is delivered.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

/// Canned failure returned by a simulated operation.
#[derive(Clone, Debug)]
pub struct MockFailure {
    status: Option<u16>,
    message: String,
    delay: Duration,
    offline: bool,
}

impl MockFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            delay: Duration::ZERO,
            offline: false,
        }
    }

    /// Fails like an unreachable host: a connect-level transport error that
    /// the default classifier treats as offline.
    pub fn offline(message: impl Into<String>) -> Self {
        Self {
            offline: true,
            ..Self::new(message)
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn to_error(&self, method: Method, uri: String) -> Error {
        if self.offline {
            return Error::Transport {
                kind: TransportErrorKind::Connect,
                method,
                uri,
                source: self.message.clone().into(),
            };
        }
        Error::Simulated {
            status: self.status,
            method,
            uri,
            message: self.message.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum MockOutcome {
    Response(MockResponse),
    Failure(MockFailure),
}

impl MockOutcome {
    pub(crate) fn delay(&self) -> Duration {
        match self {
            Self::Response(response) => response.delay,
            Self::Failure(failure) => failure.delay,
        }
    }
}

/// A descriptor paired with the outcome to substitute for live execution.
#[derive(Clone, Debug)]
pub struct Mock {
    descriptor: RequestDescriptor,
    outcome: MockOutcome,
}

impl Mock {
    pub fn respond(descriptor: RequestDescriptor, response: MockResponse) -> Self {
        Self {
            descriptor,
            outcome: MockOutcome::Response(response),
        }
    }

    pub fn fail(descriptor: RequestDescriptor, failure: MockFailure) -> Self {
        Self {
            descriptor,
            outcome: MockOutcome::Failure(failure),
        }
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    pub fn outcome(&self) -> &MockOutcome {
        &self.outcome
    }

    pub fn key(&self) -> String {
        self.descriptor.key()
    }
}

/// Registered mocks keyed by descriptor identity; the last registration for a
/// key wins.
#[derive(Debug, Default)]
pub(crate) struct MockRegistry {
    mocks: Mutex<BTreeMap<String, Mock>>,
}

impl MockRegistry {
    pub(crate) fn register(&self, mock: Mock) -> Option<Mock> {
        lock_unpoisoned(&self.mocks).insert(mock.key(), mock)
    }

    pub(crate) fn get(&self, key: &str) -> Option<Mock> {
        lock_unpoisoned(&self.mocks).get(key).cloned()
    }

    pub(crate) fn clear(&self) {
        lock_unpoisoned(&self.mocks).clear();
    }
}
