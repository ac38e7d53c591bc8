use std::sync::Arc;

use http::header::ETAG;
use tracing::{debug, warn};

use crate::descriptor::{RequestDescriptor, StorePolicy};
use crate::error::{Error, TransportErrorKind};
use crate::metrics::ClientMetrics;
use crate::response::Response;
use crate::store::{EtagStore, OfflineStore};

/// Decides whether a failure means the device is offline, making the request
/// worth persisting for replay.
pub trait OfflineClassifier: Send + Sync {
    fn is_offline(&self, error: &Error) -> bool;
}

/// Treats DNS, connect and read failures and transport timeouts as offline.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectivityClassifier;

impl OfflineClassifier for ConnectivityClassifier {
    fn is_offline(&self, error: &Error) -> bool {
        match error {
            Error::Transport { kind, .. } => matches!(
                kind,
                TransportErrorKind::Dns | TransportErrorKind::Connect | TransportErrorKind::Read
            ),
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Where an observed operation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Caller,
    /// A replayed capsule. Its original stays persisted until the replay
    /// succeeds, so offline failures are not saved again.
    Replay,
}

pub(crate) struct DecoratorParts {
    pub(crate) base_url: String,
    pub(crate) etag_store: Arc<dyn EtagStore>,
    pub(crate) offline_store: Arc<dyn OfflineStore>,
    pub(crate) classifier: Arc<dyn OfflineClassifier>,
    pub(crate) diagnostics: bool,
    pub(crate) metrics: ClientMetrics,
}

/// Side effects applied to every settled operation. Observing never changes
/// the outcome.
pub(crate) struct ResultDecorator {
    base_url: String,
    etag_store: Arc<dyn EtagStore>,
    offline_store: Arc<dyn OfflineStore>,
    classifier: Arc<dyn OfflineClassifier>,
    diagnostics: bool,
    metrics: ClientMetrics,
}

impl ResultDecorator {
    pub(crate) fn new(parts: DecoratorParts) -> Self {
        Self {
            base_url: parts.base_url,
            etag_store: parts.etag_store,
            offline_store: parts.offline_store,
            classifier: parts.classifier,
            diagnostics: parts.diagnostics,
            metrics: parts.metrics,
        }
    }

    pub(crate) fn offline_store(&self) -> &Arc<dyn OfflineStore> {
        &self.offline_store
    }

    /// `identity` is the descriptor as submitted, before any rewrite.
    pub(crate) fn observe(
        &self,
        identity: &RequestDescriptor,
        outcome: &crate::Result<Response>,
        origin: Origin,
    ) {
        match outcome {
            Ok(response) => {
                self.capture_etag(identity, response);
                self.log_response(identity, response);
            }
            Err(error) if error.is_cancelled() => {
                debug!(method = %identity.method(), path = identity.path(), "operation cancelled");
            }
            Err(error) => {
                self.log_failure(identity, error);
                if origin == Origin::Caller {
                    self.persist_if_offline(identity, error);
                }
            }
        }
    }

    fn capture_etag(&self, identity: &RequestDescriptor, response: &Response) {
        let Some(token) = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .filter(|token| !token.is_empty())
        else {
            return;
        };
        self.etag_store
            .upsert(&self.base_url, &identity.key(), token);
        self.metrics.record_etag_stored();
    }

    fn log_response(&self, identity: &RequestDescriptor, response: &Response) {
        if !self.diagnostics {
            return;
        }
        debug!(
            method = %identity.method(),
            path = identity.path(),
            key = %identity.key(),
            status = response.status().as_u16(),
            simulated = response.is_simulated(),
            body_bytes = response.body().len(),
            "request completed"
        );
    }

    fn log_failure(&self, identity: &RequestDescriptor, error: &Error) {
        if !self.diagnostics {
            return;
        }
        warn!(
            method = %identity.method(),
            path = identity.path(),
            key = %identity.key(),
            error_code = error.code().as_str(),
            error = %error,
            "request failed"
        );
    }

    fn persist_if_offline(&self, identity: &RequestDescriptor, error: &Error) {
        if identity.store_policy() != StorePolicy::OfflineRetryable
            || !self.classifier.is_offline(error)
        {
            return;
        }
        match self.offline_store.save(identity.clone()) {
            Ok(capsule) => {
                self.metrics.record_offline_capsule_saved();
                debug!(
                    sequence = capsule.sequence,
                    method = %identity.method(),
                    path = identity.path(),
                    "persisted offline capsule"
                );
            }
            Err(store_error) => {
                warn!(
                    method = %identity.method(),
                    path = identity.path(),
                    error = %store_error,
                    "failed to persist offline capsule"
                );
            }
        }
    }
}
