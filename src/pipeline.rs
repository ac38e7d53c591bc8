use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use http::header::{ACCEPT_LANGUAGE, AUTHORIZATION, HeaderName, HeaderValue, IF_NONE_MATCH};
use http::HeaderMap;

use crate::descriptor::RequestDescriptor;
use crate::request::WireRequest;
use crate::store::EtagStore;
use crate::util::{lock_unpoisoned, merge_headers};

pub type BeforeEachHook = Arc<dyn Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync>;
pub type HeaderProvider = Arc<dyn Fn() -> HeaderMap + Send + Sync>;
pub type PreProcessHook = Arc<dyn Fn(&mut WireRequest) + Send + Sync>;

/// Gate between a verb call and request building. It may delay release or
/// hand back a different descriptor.
pub trait Middleware: Send + Sync {
    fn release(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, crate::Result<RequestDescriptor>>;
}

impl<F, Fut> Middleware for F
where
    F: Fn(RequestDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<RequestDescriptor>> + Send + 'static,
{
    fn release(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, crate::Result<RequestDescriptor>> {
        Box::pin(self(descriptor))
    }
}

/// Turns descriptors into wire requests: rewrite, header resolution,
/// serialization, then raw mutation.
pub(crate) struct RequestPipeline {
    base_url: String,
    custom_headers: Mutex<HeaderMap>,
    locale: HeaderValue,
    before_each: Option<BeforeEachHook>,
    additional_headers: Option<HeaderProvider>,
    pre_process: Option<PreProcessHook>,
    etag_store: Arc<dyn EtagStore>,
}

pub(crate) struct PipelineHooks {
    pub(crate) before_each: Option<BeforeEachHook>,
    pub(crate) additional_headers: Option<HeaderProvider>,
    pub(crate) pre_process: Option<PreProcessHook>,
}

impl RequestPipeline {
    pub(crate) fn new(
        base_url: String,
        custom_headers: HeaderMap,
        locale: HeaderValue,
        hooks: PipelineHooks,
        etag_store: Arc<dyn EtagStore>,
    ) -> Self {
        Self {
            base_url,
            custom_headers: Mutex::new(custom_headers),
            locale,
            before_each: hooks.before_each,
            additional_headers: hooks.additional_headers,
            pre_process: hooks.pre_process,
            etag_store,
        }
    }

    pub(crate) fn rewrite(&self, descriptor: RequestDescriptor) -> RequestDescriptor {
        match &self.before_each {
            Some(hook) => hook(descriptor),
            None => descriptor,
        }
    }

    /// Static custom headers, then the locale, then the dynamic provider;
    /// later sources win on collisions.
    pub(crate) fn resolve_headers(&self) -> HeaderMap {
        let mut headers = lock_unpoisoned(&self.custom_headers).clone();
        headers.insert(ACCEPT_LANGUAGE, self.locale.clone());
        if let Some(provider) = &self.additional_headers {
            merge_headers(&mut headers, &provider());
        }
        headers
    }

    /// Builds `descriptor` into wire form. Returns the rewritten descriptor
    /// alongside the request; identity stays with the descriptor passed in.
    pub(crate) fn build(
        &self,
        descriptor: &RequestDescriptor,
    ) -> crate::Result<(RequestDescriptor, WireRequest)> {
        let rewritten = self.rewrite(descriptor.clone());
        let mut headers = self.resolve_headers();

        if descriptor.revalidates()
            && let Some(token) = self.etag_store.get(&self.base_url, &descriptor.key())
            && let Ok(value) = HeaderValue::from_str(&token)
        {
            headers.insert(IF_NONE_MATCH, value);
        }

        let mut request = WireRequest::from_descriptor(&rewritten, &self.base_url, headers)?;
        if let Some(hook) = &self.pre_process {
            hook(&mut request);
        }
        Ok((rewritten, request))
    }

    pub(crate) fn set_custom_header(&self, name: HeaderName, value: HeaderValue) {
        lock_unpoisoned(&self.custom_headers).insert(name, value);
    }

    pub(crate) fn set_authorization(&self, mut value: HeaderValue) {
        value.set_sensitive(true);
        self.set_custom_header(AUTHORIZATION, value);
    }

    pub(crate) fn custom_header(&self, name: &HeaderName) -> Option<HeaderValue> {
        lock_unpoisoned(&self.custom_headers).get(name).cloned()
    }
}
