use tokio::sync::Mutex;
use tracing::{debug, info_span, warn};

use crate::client::Client;
use crate::decorator::Origin;
use crate::mode::ConcurrencyMode;
use crate::response::Response;
use crate::scheduler::OperationScheduler;

/// Restores the scheduler's mode when a replay pass ends, however it ends.
struct ModeRestore<'a> {
    scheduler: &'a OperationScheduler,
    previous: ConcurrencyMode,
}

impl<'a> ModeRestore<'a> {
    fn force(scheduler: &'a OperationScheduler, mode: ConcurrencyMode) -> Self {
        let previous = scheduler.set_mode(mode);
        debug!(
            previous = previous.as_str(),
            forced = mode.as_str(),
            "forcing concurrency mode for replay"
        );
        Self {
            scheduler,
            previous,
        }
    }
}

impl Drop for ModeRestore<'_> {
    fn drop(&mut self) {
        self.scheduler.set_mode(self.previous);
    }
}

/// Re-submits persisted capsules one at a time, oldest first. A capsule
/// leaves the store only once its replay succeeds.
#[derive(Debug, Default)]
pub(crate) struct ReplayCoordinator {
    pass: Mutex<()>,
}

impl ReplayCoordinator {
    /// Resolves with the outcome of the last capsule in the pass, or
    /// `Ok(None)` when nothing was pending.
    pub(crate) async fn replay(&self, client: &Client) -> crate::Result<Option<Response>> {
        let _pass = self.pass.lock().await;

        let capsules = client.offline_store().pending_capsules()?;
        if capsules.is_empty() {
            debug!("no offline capsules to replay");
            return Ok(None);
        }

        let restore = ModeRestore::force(client.scheduler(), ConcurrencyMode::Synchronous);
        client.metrics().record_replay_pass(capsules.len());

        let submitted: Vec<_> = {
            let span = info_span!("reqflow.replay", capsules = capsules.len());
            let _enter = span.enter();
            capsules
                .into_iter()
                .map(|capsule| {
                    let sequence = capsule.sequence;
                    let submission = client.submit(capsule.descriptor, Origin::Replay);
                    if let Err(error) = &submission {
                        warn!(
                            sequence,
                            error_code = error.code().as_str(),
                            error = %error,
                            "offline capsule cannot be submitted, keeping it"
                        );
                    }
                    (sequence, submission)
                })
                .collect()
        };

        let mut last = None;
        for (sequence, submission) in submitted {
            let outcome = match submission {
                Ok(operation) => operation.await,
                Err(error) => Err(error),
            };
            if outcome.is_ok() {
                consume(client, sequence);
            }
            last = Some(outcome);
        }
        drop(restore);

        last.transpose()
    }
}

fn consume(client: &Client, sequence: u64) {
    match client.offline_store().remove(sequence) {
        Ok(true) => debug!(sequence, "consumed replayed offline capsule"),
        Ok(false) => debug!(sequence, "replayed offline capsule was already gone"),
        Err(error) => warn!(
            sequence,
            error = %error,
            "failed to remove replayed offline capsule"
        ),
    }
}
