use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub operations_submitted: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operations_cancelled: u64,
    pub simulated_operations: u64,
    pub in_flight: u64,
    pub etags_stored: u64,
    pub offline_capsules_saved: u64,
    pub replay_passes: u64,
    pub replayed_capsules: u64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Arc<ClientMetricsInner>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    operations_submitted: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    operations_cancelled: AtomicU64,
    simulated_operations: AtomicU64,
    in_flight: AtomicU64,
    etags_stored: AtomicU64,
    offline_capsules_saved: AtomicU64,
    replay_passes: AtomicU64,
    replayed_capsules: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

impl ClientMetrics {
    pub(crate) fn record_submitted(&self, simulated: bool) {
        self.inner
            .operations_submitted
            .fetch_add(1, Ordering::Relaxed);
        if simulated {
            self.inner
                .simulated_operations
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_completed(&self, result: &Result<Response, Error>) {
        match result {
            Ok(response) => {
                self.inner
                    .operations_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                let mut counts = lock_unpoisoned(&self.inner.status_counts);
                *counts.entry(response.status().as_u16()).or_insert(0) += 1;
            }
            Err(error) if error.is_cancelled() => {
                self.inner
                    .operations_cancelled
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.inner.operations_failed.fetch_add(1, Ordering::Relaxed);
                let mut counts = lock_unpoisoned(&self.inner.error_counts);
                *counts.entry(error.code().as_str().to_owned()).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn record_etag_stored(&self) {
        self.inner.etags_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_offline_capsule_saved(&self) {
        self.inner
            .offline_capsules_saved
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay_pass(&self, capsules: usize) {
        self.inner.replay_passes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .replayed_capsules
            .fetch_add(capsules as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            operations_submitted: self.inner.operations_submitted.load(Ordering::Relaxed),
            operations_succeeded: self.inner.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.inner.operations_failed.load(Ordering::Relaxed),
            operations_cancelled: self.inner.operations_cancelled.load(Ordering::Relaxed),
            simulated_operations: self.inner.simulated_operations.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            etags_stored: self.inner.etags_stored.load(Ordering::Relaxed),
            offline_capsules_saved: self.inner.offline_capsules_saved.load(Ordering::Relaxed),
            replay_passes: self.inner.replay_passes.load(Ordering::Relaxed),
            replayed_capsules: self.inner.replayed_capsules.load(Ordering::Relaxed),
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
