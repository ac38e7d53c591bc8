use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::descriptor::{Parameters, RequestDescriptor};
use crate::error::Error;
use crate::util::{
    append_query_pairs, encode_form_pairs, parse_header_name, parse_header_value,
    redact_uri_for_logs, resolve_uri,
};

/// A fully serialized request, ready for a transport.
#[derive(Clone, Debug)]
pub struct WireRequest {
    method: Method,
    uri_text: String,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl WireRequest {
    /// Serializes `descriptor` against `base_url`. `headers` are the already
    /// merged client-level headers; the descriptor's own headers override them.
    pub(crate) fn from_descriptor(
        descriptor: &RequestDescriptor,
        base_url: &str,
        mut headers: HeaderMap,
    ) -> crate::Result<Self> {
        let method = descriptor.method().clone();
        let (path, body, content_type) = match descriptor.parameters() {
            Parameters::None => (descriptor.path().to_owned(), Bytes::new(), None),
            Parameters::Query(pairs) => (
                append_query_pairs(descriptor.path(), pairs),
                Bytes::new(),
                None,
            ),
            Parameters::Form(pairs) => (
                descriptor.path().to_owned(),
                Bytes::from(encode_form_pairs(pairs)),
                Some("application/x-www-form-urlencoded"),
            ),
            Parameters::Json(value) => {
                if !method_allows_body(&method) {
                    return Err(Error::RequestBuild {
                        method,
                        path: descriptor.path().to_owned(),
                        message: "json parameters require a method that carries a body"
                            .to_owned(),
                    });
                }
                let body =
                    serde_json::to_vec(value).map_err(|source| Error::SerializeJson { source })?;
                (
                    descriptor.path().to_owned(),
                    Bytes::from(body),
                    Some("application/json"),
                )
            }
        };

        let (uri_text, uri) = resolve_uri(base_url, &path)?;

        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        for (name, value) in descriptor.headers() {
            let header_name = parse_header_name(name)?;
            let header_value = parse_header_value(name, value)?;
            headers.insert(header_name, header_value);
        }

        Ok(Self {
            method,
            uri_text,
            uri,
            headers,
            body,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn uri_text(&self) -> &str {
        &self.uri_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn host(&self) -> Option<&str> {
        self.uri.host()
    }

    pub(crate) fn redacted_uri(&self) -> String {
        redact_uri_for_logs(&self.uri_text)
    }

    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Bytes) {
        (self.method, self.uri, self.headers, self.body)
    }
}

fn method_allows_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}
