use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::config::TransportConfig;
use crate::error::Error;
use crate::request::WireRequest;
use crate::tls::{TrustPolicy, build_client_config};
use crate::util::classify_transport_error;

/// Raw result of a transport round trip, before status policy is applied.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Executes wire requests against the network. Dropping the returned future
/// must abort the request; the scheduler relies on this for cancellation.
pub trait Transport: Send + Sync {
    fn send(&self, request: WireRequest) -> BoxFuture<'static, crate::Result<TransportResponse>>;
}

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Pooled HTTP/1.1 + HTTP/2 transport over hyper with rustls.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
    request_timeout: Duration,
    max_response_body_bytes: usize,
}

impl HyperTransport {
    pub fn new(
        config: &TransportConfig,
        trust_policy: &TrustPolicy,
        base_host: Option<String>,
    ) -> crate::Result<Self> {
        let tls_config = build_client_config(trust_policy, base_host)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout));

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(config.http2_only)
            .build(https);

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
            max_response_body_bytes: config.max_response_body_bytes,
        })
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: WireRequest) -> BoxFuture<'static, crate::Result<TransportResponse>> {
        let client = self.client.clone();
        let request_timeout = self.request_timeout;
        let max_response_body_bytes = self.max_response_body_bytes;

        async move {
            let method = request.method().clone();
            let uri = request.redacted_uri();
            let http_request = build_http_request(request, &uri)?;

            let response = match timeout(request_timeout, client.request(http_request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(source)) => {
                    return Err(Error::Transport {
                        kind: classify_transport_error(&source),
                        method,
                        uri,
                        source: Box::new(source),
                    });
                }
                Err(_) => return Err(timeout_error(request_timeout, method, uri)),
            };

            let (parts, body) = response.into_parts();
            let limited = Limited::new(body, max_response_body_bytes);
            let body = match timeout(request_timeout, limited.collect()).await {
                Ok(Ok(collected)) => collected.to_bytes(),
                Ok(Err(source)) if source.downcast_ref::<LengthLimitError>().is_some() => {
                    return Err(Error::ResponseBodyTooLarge {
                        limit_bytes: max_response_body_bytes,
                        method,
                        uri,
                    });
                }
                Ok(Err(source)) => {
                    return Err(Error::ReadBody {
                        method,
                        uri,
                        source,
                    });
                }
                Err(_) => return Err(timeout_error(request_timeout, method, uri)),
            };

            Ok(TransportResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        }
        .boxed()
    }
}

fn timeout_error(request_timeout: Duration, method: Method, uri: String) -> Error {
    Error::Timeout {
        timeout_ms: request_timeout.as_millis(),
        method,
        uri,
    }
}

fn build_http_request(request: WireRequest, redacted_uri: &str) -> crate::Result<Request<Full<Bytes>>> {
    let (method, uri, headers, body) = request.into_parts();
    let mut builder = Request::builder().method(method.clone()).uri(uri);
    if let Some(target) = builder.headers_mut() {
        *target = headers;
    }
    builder
        .body(Full::new(body))
        .map_err(|source| Error::RequestBuild {
            method,
            path: redacted_uri.to_owned(),
            message: source.to_string(),
        })
}
