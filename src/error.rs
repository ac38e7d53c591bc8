use http::Method;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
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

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidBaseUrl,
    InvalidUri,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    NoMockProvided,
    Transport,
    Timeout,
    ReadBody,
    ResponseBodyTooLarge,
    HttpStatus,
    Simulated,
    Deserialize,
    Cancelled,
    TlsConfig,
    Store,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidBaseUrl => "invalid_base_url",
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::NoMockProvided => "no_mock_provided",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::Simulated => "simulated",
            Self::Deserialize => "deserialize",
            Self::Cancelled => "cancelled",
            Self::TlsConfig => "tls_config",
            Self::Store => "store",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid base url: {base_url}")]
    InvalidBaseUrl { base_url: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request for {method} {path}: {message}")]
    RequestBuild {
        method: Method,
        path: String,
        message: String,
    },
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
    #[error("no mock registered for {method} {path} (key {key}) in forced simulation mode")]
    NoMockProvided {
        method: Method,
        path: String,
        key: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("response body too large (limit {limit_bytes} bytes) for {method} {uri}")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("simulated failure for {method} {uri}: {message}")]
    Simulated {
        status: Option<u16>,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("request cancelled: {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("offline store failure: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidBaseUrl { .. } => ErrorCode::InvalidBaseUrl,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::NoMockProvided { .. } => ErrorCode::NoMockProvided,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Simulated { .. } => ErrorCode::Simulated,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::Store { .. } => ErrorCode::Store,
        }
    }

    /// Errors raised while turning a descriptor into a wire request. They
    /// never reach the scheduler.
    pub const fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUri { .. }
                | Self::SerializeJson { .. }
                | Self::SerializeQuery { .. }
                | Self::SerializeForm { .. }
                | Self::RequestBuild { .. }
                | Self::InvalidHeaderName { .. }
                | Self::InvalidHeaderValue { .. }
        )
    }

    /// Errors produced by an executed operation, live or simulated.
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::ReadBody { .. }
                | Self::ResponseBodyTooLarge { .. }
                | Self::HttpStatus { .. }
                | Self::Simulated { .. }
        )
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
