//! Health reconciler: periodically polls every worker's `/health` and
//! corrects the dispatcher's busy flags from what the workers report.
//!
//! This is how a worker whose analyze call hung (or whose completion was
//! lost) gets released, and how work a worker picked up from elsewhere is
//! accounted for.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::client::WorkerClient;
use super::dispatcher::{Dispatcher, HealthTransition};

/// Counts from a single reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub probed: usize,
    pub unreachable: usize,
    pub adopted: usize,
    pub released: usize,
}

/// Polls worker health and folds the reports into a [`Dispatcher`].
pub struct HealthReconciler {
    dispatcher: Arc<Dispatcher>,
    client: Arc<dyn WorkerClient>,
    probe_timeout: Duration,
}

impl HealthReconciler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let client = dispatcher.client();
        let probe_timeout = dispatcher.config().health_timeout;
        Arc::new(Self {
            dispatcher,
            client,
            probe_timeout,
        })
    }

    /// Refresh the pool, probe every worker concurrently (no lock held), then
    /// apply the reports in directory order. Unreachable workers keep their
    /// current state, as do workers whose job changed while being probed.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let workers = self.dispatcher.refresh_workers().await;

        let probes = workers.into_iter().map(|w| {
            let client = Arc::clone(&self.client);
            let timeout = self.probe_timeout;
            async move {
                let health = client.health(&w.address, timeout).await;
                (w.address, w.current_job, health)
            }
        });
        let results = join_all(probes).await;

        let mut report = ReconcileReport {
            probed: results.len(),
            ..ReconcileReport::default()
        };

        for (address, probed, health) in results {
            let health = match health {
                Ok(health) => health,
                Err(e) => {
                    warn!(address = %address, error = %e, "Health check failed");
                    report.unreachable += 1;
                    continue;
                }
            };

            match self
                .dispatcher
                .apply_health(&address, probed.as_ref(), &health)
                .await
            {
                HealthTransition::Adopted => report.adopted += 1,
                HealthTransition::Released { .. } => report.released += 1,
                HealthTransition::Unchanged | HealthTransition::Stale => {}
                HealthTransition::UnknownWorker => {
                    debug!(address = %address, "Worker left the pool during the health pass");
                }
            }
        }

        if report.adopted > 0 || report.released > 0 {
            info!(
                probed = report.probed,
                adopted = report.adopted,
                released = report.released,
                "Health pass corrected worker state"
            );
        }
        report
    }
}

/// Spawn the periodic reconciler. The first pass runs after `initial_delay`.
pub fn spawn_health_reconciler(
    reconciler: Arc<HealthReconciler>,
    interval: Duration,
    initial_delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            reconciler.reconcile_once().await;
        }
    })
}
