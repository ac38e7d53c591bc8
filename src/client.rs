use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::{BoxFuture, FutureExt};
use http::header::{ACCEPT_LANGUAGE, AUTHORIZATION, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tracing::debug;

use crate::config::{StatusPolicy, TransportConfig};
use crate::decorator::{
    ConnectivityClassifier, DecoratorParts, OfflineClassifier, Origin, ResultDecorator,
};
use crate::descriptor::RequestDescriptor;
use crate::error::Error;
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::mock::{Mock, MockOutcome, MockRegistry};
use crate::mode::{ConcurrencyMode, ExecutionMode};
use crate::pipeline::{
    BeforeEachHook, HeaderProvider, Middleware, PipelineHooks, PreProcessHook, RequestPipeline,
};
use crate::replay::ReplayCoordinator;
use crate::request::WireRequest;
use crate::response::Response;
use crate::scheduler::{Operation, OperationScheduler};
use crate::selector::{OperationSpec, TransportSelector};
use crate::store::{EtagStore, MemoryEtagStore, MemoryOfflineStore, OfflineCapsule, OfflineStore};
use crate::tls::TrustPolicy;
use crate::transport::{HyperTransport, Transport, TransportResponse};
use crate::util::{
    base_url_host, lock_unpoisoned, parse_header_name, parse_header_value, truncate_body,
    validate_base_url,
};

const DEFAULT_LOCALE: &str = "en-US";

pub struct ClientBuilder {
    base_url: String,
    mode: ConcurrencyMode,
    execution_mode: ExecutionMode,
    transport_config: TransportConfig,
    trust_policy: TrustPolicy,
    transport: Option<Arc<dyn Transport>>,
    default_headers: HeaderMap,
    locale: String,
    additional_headers: Option<HeaderProvider>,
    before_each: Option<BeforeEachHook>,
    pre_process: Option<PreProcessHook>,
    middleware: Option<Arc<dyn Middleware>>,
    etag_store: Arc<dyn EtagStore>,
    offline_store: Arc<dyn OfflineStore>,
    offline_classifier: Arc<dyn OfflineClassifier>,
    diagnostics: bool,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            mode: ConcurrencyMode::default(),
            execution_mode: ExecutionMode::default(),
            transport_config: TransportConfig::default(),
            trust_policy: TrustPolicy::default(),
            transport: None,
            default_headers: HeaderMap::new(),
            locale: DEFAULT_LOCALE.to_owned(),
            additional_headers: None,
            before_each: None,
            pre_process: None,
            middleware: None,
            etag_store: Arc::new(MemoryEtagStore::new()),
            offline_store: Arc::new(MemoryOfflineStore::new()),
            offline_classifier: Arc::new(ConnectivityClassifier),
            diagnostics: true,
        }
    }

    pub fn mode(mut self, mode: ConcurrencyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn execution_mode(mut self, execution_mode: ExecutionMode) -> Self {
        self.execution_mode = execution_mode;
        self
    }

    pub fn transport_config(mut self, transport_config: TransportConfig) -> Self {
        self.transport_config = transport_config;
        self
    }

    pub fn trust_policy(mut self, trust_policy: TrustPolicy) -> Self {
        self.trust_policy = trust_policy;
        self
    }

    /// Replaces the built-in hyper transport. `transport_config` and
    /// `trust_policy` then only contribute the status policy.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    /// Sent as `Accept-Language` on every request.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn additional_headers<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> HeaderMap + Send + Sync + 'static,
    {
        self.additional_headers = Some(Arc::new(provider));
        self
    }

    pub fn before_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync + 'static,
    {
        self.before_each = Some(Arc::new(hook));
        self
    }

    pub fn pre_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WireRequest) + Send + Sync + 'static,
    {
        self.pre_process = Some(Arc::new(hook));
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware = Some(Arc::new(middleware));
        self
    }

    pub fn etag_store(mut self, etag_store: Arc<dyn EtagStore>) -> Self {
        self.etag_store = etag_store;
        self
    }

    pub fn offline_store(mut self, offline_store: Arc<dyn OfflineStore>) -> Self {
        self.offline_store = offline_store;
        self
    }

    pub fn offline_classifier(mut self, offline_classifier: Arc<dyn OfflineClassifier>) -> Self {
        self.offline_classifier = offline_classifier;
        self
    }

    pub fn diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        validate_base_url(&self.base_url)?;
        let locale = parse_header_value(ACCEPT_LANGUAGE.as_str(), &self.locale)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(
                &self.transport_config,
                &self.trust_policy,
                base_url_host(&self.base_url),
            )?),
        };

        let metrics = ClientMetrics::default();
        let pipeline = RequestPipeline::new(
            self.base_url.clone(),
            self.default_headers,
            locale,
            PipelineHooks {
                before_each: self.before_each,
                additional_headers: self.additional_headers,
                pre_process: self.pre_process,
            },
            Arc::clone(&self.etag_store),
        );
        let decorator = ResultDecorator::new(DecoratorParts {
            base_url: self.base_url.clone(),
            etag_store: Arc::clone(&self.etag_store),
            offline_store: self.offline_store,
            classifier: self.offline_classifier,
            diagnostics: self.diagnostics,
            metrics: metrics.clone(),
        });

        Ok(Client {
            inner: Arc::new(ClientInner {
                scheduler: OperationScheduler::new(self.mode, metrics.clone()),
                base_url: self.base_url,
                execution_mode: Mutex::new(self.execution_mode),
                status_policy: self.transport_config.status_policy,
                pipeline,
                mocks: MockRegistry::default(),
                decorator: Arc::new(decorator),
                transport,
                middleware: self.middleware,
                etag_store: self.etag_store,
                replay: ReplayCoordinator::default(),
                metrics,
            }),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqflow client: {error}"))
    }
}

struct ClientInner {
    base_url: String,
    execution_mode: Mutex<ExecutionMode>,
    status_policy: StatusPolicy,
    pipeline: RequestPipeline,
    mocks: MockRegistry,
    scheduler: OperationScheduler,
    decorator: Arc<ResultDecorator>,
    transport: Arc<dyn Transport>,
    middleware: Option<Arc<dyn Middleware>>,
    etag_store: Arc<dyn EtagStore>,
    replay: ReplayCoordinator,
    metrics: ClientMetrics,
}

/// Request orchestrator: builds descriptors into wire requests, routes them to
/// mocks or the live transport, schedules them under the current
/// [`ConcurrencyMode`] and applies etag and offline side effects to results.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Tags `descriptor` with `method`, waits for the middleware gate, then
    /// submits it. Build and selection errors are returned without scheduling
    /// anything.
    pub async fn execute(
        &self,
        method: Method,
        descriptor: RequestDescriptor,
    ) -> crate::Result<Response> {
        let descriptor = descriptor.with_method(method);
        let descriptor = match &self.inner.middleware {
            Some(middleware) => middleware.release(descriptor).await?,
            None => descriptor,
        };
        self.submit(descriptor, Origin::Caller)?.await
    }

    pub async fn get(&self, descriptor: RequestDescriptor) -> crate::Result<Response> {
        self.execute(Method::GET, descriptor).await
    }

    pub async fn post(&self, descriptor: RequestDescriptor) -> crate::Result<Response> {
        self.execute(Method::POST, descriptor).await
    }

    pub async fn put(&self, descriptor: RequestDescriptor) -> crate::Result<Response> {
        self.execute(Method::PUT, descriptor).await
    }

    pub async fn patch(&self, descriptor: RequestDescriptor) -> crate::Result<Response> {
        self.execute(Method::PATCH, descriptor).await
    }

    pub async fn delete(&self, descriptor: RequestDescriptor) -> crate::Result<Response> {
        self.execute(Method::DELETE, descriptor).await
    }

    pub async fn head(&self, descriptor: RequestDescriptor) -> crate::Result<Response> {
        self.execute(Method::HEAD, descriptor).await
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.inner.scheduler.mode()
    }

    /// Applies to work submitted after the call; returns the previous mode.
    pub fn reset_mode(&self, mode: ConcurrencyMode) -> ConcurrencyMode {
        self.inner.scheduler.set_mode(mode)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        *lock_unpoisoned(&self.inner.execution_mode)
    }

    pub fn set_execution_mode(&self, execution_mode: ExecutionMode) -> ExecutionMode {
        std::mem::replace(
            &mut *lock_unpoisoned(&self.inner.execution_mode),
            execution_mode,
        )
    }

    /// Sets `Authorization: Basic <base64(username:password)>`.
    pub fn authenticate_basic(&self, username: &str, password: &str) -> crate::Result<()> {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        self.authenticate_header(&format!("Basic {encoded}"))
    }

    pub fn authenticate_bearer(&self, token: &str) -> crate::Result<()> {
        self.authenticate_header(&format!("Bearer {token}"))
    }

    /// Sets the `Authorization` header verbatim, replacing any previous value.
    pub fn authenticate_header(&self, value: &str) -> crate::Result<()> {
        let value = parse_header_value(AUTHORIZATION.as_str(), value)?;
        self.inner.pipeline.set_authorization(value);
        Ok(())
    }

    pub fn set_default_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.pipeline.set_custom_header(name, value);
    }

    pub fn default_header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.inner.pipeline.custom_header(name)
    }

    /// Registers `mock` under its descriptor key, returning the mock it
    /// replaced.
    pub fn register(&self, mock: Mock) -> Option<Mock> {
        self.inner.mocks.register(mock)
    }

    pub fn clear_mocks(&self) {
        self.inner.mocks.clear();
    }

    /// Settles every queued and in-flight operation with
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    pub fn cancel_all_requests(&self) {
        debug!("cancelling all requests");
        self.inner.scheduler.cancel_all();
    }

    /// Re-submits every pending offline capsule in synchronous mode, oldest
    /// first, and resolves with the outcome of the last one. A capsule is
    /// removed only when its replay succeeds. Returns `Ok(None)` without
    /// touching the mode when nothing is pending.
    pub async fn replay(&self) -> crate::Result<Option<Response>> {
        self.inner.replay.replay(self).await
    }

    /// The stored validation token for `descriptor` under this base URL.
    pub fn etag(&self, descriptor: &RequestDescriptor) -> Option<String> {
        self.inner
            .etag_store
            .get(&self.inner.base_url, &descriptor.key())
    }

    pub fn pending_capsules(&self) -> crate::Result<Vec<OfflineCapsule>> {
        self.offline_store().pending_capsules()
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn offline_store(&self) -> &Arc<dyn OfflineStore> {
        self.inner.decorator.offline_store()
    }

    pub(crate) fn scheduler(&self) -> &OperationScheduler {
        &self.inner.scheduler
    }

    pub(crate) fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    /// Build, select and enqueue `descriptor` without the middleware gate.
    /// The decorator runs inside the scheduled work so cancelled operations
    /// never reach it.
    pub(crate) fn submit(
        &self,
        descriptor: RequestDescriptor,
        origin: Origin,
    ) -> crate::Result<Operation> {
        let inner = &self.inner;
        let execution_mode = self.execution_mode();
        let (rewritten, request) = inner.pipeline.build(&descriptor)?;
        let operation = TransportSelector::new(&inner.mocks, &inner.pipeline).select(
            &descriptor,
            rewritten,
            request,
            execution_mode,
        )?;

        let method = operation.request().method().clone();
        let uri = operation.request().redacted_uri();
        debug!(
            method = %method,
            uri = %uri,
            execution_mode = execution_mode.as_str(),
            simulated = operation.is_simulated(),
            "submitting operation"
        );
        inner.metrics.record_submitted(operation.is_simulated());

        let work = self.operation_work(operation);
        let decorator = Arc::clone(&inner.decorator);
        let decorated = async move {
            let outcome = work.await;
            decorator.observe(&descriptor, &outcome, origin);
            outcome
        }
        .boxed();
        Ok(inner.scheduler.submit(method, uri, decorated))
    }

    fn operation_work(&self, operation: OperationSpec) -> BoxFuture<'static, crate::Result<Response>> {
        let status_policy = self.inner.status_policy;
        match operation {
            OperationSpec::Live {
                descriptor,
                request,
            } => {
                let transport = Arc::clone(&self.inner.transport);
                async move {
                    let method = request.method().clone();
                    let uri = request.redacted_uri();
                    let response = transport.send(request).await?;
                    settle(status_policy, response, descriptor, false, method, uri)
                }
                .boxed()
            }
            OperationSpec::Simulated {
                descriptor,
                request,
                mock,
            } => async move {
                let method = request.method().clone();
                let uri = request.redacted_uri();
                let delay = mock.outcome().delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match mock.outcome() {
                    MockOutcome::Response(canned) => {
                        let response = TransportResponse {
                            status: canned.status(),
                            headers: canned.headers().clone(),
                            body: canned.body_bytes().clone(),
                        };
                        settle(status_policy, response, descriptor, true, method, uri)
                    }
                    MockOutcome::Failure(failure) => Err(failure.to_error(method, uri)),
                }
            }
            .boxed(),
        }
    }
}

fn settle(
    status_policy: StatusPolicy,
    response: TransportResponse,
    descriptor: RequestDescriptor,
    simulated: bool,
    method: Method,
    uri: String,
) -> crate::Result<Response> {
    if status_policy.rejects(response.status) {
        return Err(Error::HttpStatus {
            status: response.status.as_u16(),
            method,
            uri,
            body: truncate_body(&response.body),
        });
    }
    Ok(Response::new(
        response.status,
        response.headers,
        response.body,
        descriptor,
        simulated,
    ))
}
