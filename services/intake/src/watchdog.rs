use crate::callback::{classify, synthesize};
use crate::config::WatchdogConfig;
use crate::error::IntakeError;
use crate::lifecycle::LifecycleEvent;
use crate::locks::ProductGuard;
use crate::orchestrator::Orchestrator;
use crate::product::{CallbackKind, LifecycleState, Product, ProductId};
use crate::transform::TransformStatus;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Order in which missing callbacks are replayed
const REPLAY_ORDER: [CallbackKind; 3] = [
    CallbackKind::Product,
    CallbackKind::Metadata,
    CallbackKind::Finished,
];

/// What a pass did, for logs and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub examined: usize,
    pub skipped_busy: usize,
    pub recovered: usize,
    pub failed: usize,
    pub resubmitted: usize,
    pub errors: usize,
}

/// Per-product result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciled {
    Busy,
    Idle,
    Recovered,
    Failed,
    Resubmitted,
}

/// Recovers products whose callbacks stalled by polling the transform service
/// and replaying its answer through the live callback path
pub struct Watchdog {
    orchestrator: Orchestrator,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(orchestrator: Orchestrator, config: WatchdogConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Run passes on a fixed interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval_secs,
            deadline_secs = self.config.deadline_secs,
            "Watchdog started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Watchdog stopping");
                    return;
                }
                _ = interval.tick() => {
                    match self.run_pass(Utc::now()).await {
                        Ok(report) => debug!(?report, "Watchdog pass complete"),
                        Err(e) => error!(error = %e, "Watchdog pass aborted"),
                    }
                }
            }
        }
    }

    /// One scan over every product that needs attention at `now`
    #[instrument(skip(self))]
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, IntakeError> {
        let cutoff = now - self.config.stall_after();
        let limit = self.config.batch_size.max(1);
        let report = Mutex::new(PassReport::default());
        let mut after: Option<ProductId> = None;

        loop {
            let page = self
                .orchestrator
                .ledger()
                .list_unfinished(cutoff, after, limit)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            let page_len = page.len();

            stream::iter(page)
                .for_each_concurrent(self.config.concurrency.max(1), |product| {
                    let report = &report;
                    async move {
                        let id = product.id;
                        let result = self.reconcile(product, now).await;
                        let mut report = report.lock();
                        report.examined += 1;
                        match result {
                            Ok(Reconciled::Busy) => report.skipped_busy += 1,
                            Ok(Reconciled::Idle) => {}
                            Ok(Reconciled::Recovered) => report.recovered += 1,
                            Ok(Reconciled::Failed) => report.failed += 1,
                            Ok(Reconciled::Resubmitted) => report.resubmitted += 1,
                            Err(e) => {
                                report.errors += 1;
                                warn!(product_id = %id, error = %e, "Watchdog could not reconcile product");
                            }
                        }
                    }
                })
                .await;

            if page_len < limit {
                break;
            }
        }

        metrics::counter!("intake.watchdog.passes").increment(1);
        let report = report.into_inner();
        metrics::counter!("intake.watchdog.recovered").increment(report.recovered as u64);
        Ok(report)
    }

    async fn reconcile(&self, product: Product, now: DateTime<Utc>) -> Result<Reconciled, IntakeError> {
        let id = product.id;
        let Some(guard) = self.orchestrator.try_lock(id) else {
            return Ok(Reconciled::Busy);
        };

        let before = product.state;
        let product = self.orchestrator.settle_locked(&guard, id, now).await?;
        if product.state.is_terminal() || product.state == LifecycleState::Finished {
            return Ok(outcome(before, product.state));
        }
        // listed only for its pending effects
        if product.created_at > now - self.config.stall_after() {
            return Ok(Reconciled::Idle);
        }

        let past_deadline = product.created_at + self.config.deadline() <= now;
        let status = self.orchestrator.transform().status(id).await;
        debug!(product_id = %id, status = ?status, "Polled transform status");

        match status {
            Ok(TransformStatus::Complete { metadata }) => {
                self.replay(&guard, product, metadata, now).await
            }
            Ok(TransformStatus::Failed { reason }) => {
                let applied = self
                    .orchestrator
                    .apply(&guard, id, LifecycleEvent::TransformFailed { reason }, now)
                    .await?;
                Ok(outcome(before, applied.product.state))
            }
            Ok(TransformStatus::Unknown) if !past_deadline && !product.submitted => {
                drop(guard);
                self.orchestrator.submit(id).await?;
                info!(product_id = %id, "Resubmitted product to transform service");
                Ok(Reconciled::Resubmitted)
            }
            Ok(TransformStatus::Pending) | Ok(TransformStatus::Unknown) if past_deadline => {
                self.expire(&guard, id, before, now).await
            }
            Err(e) if past_deadline => {
                warn!(product_id = %id, error = %e, "Transform service unreachable at deadline");
                self.expire(&guard, id, before, now).await
            }
            Ok(_) => Ok(Reconciled::Idle),
            Err(e) => Err(e.into()),
        }
    }

    async fn expire(
        &self,
        guard: &ProductGuard,
        id: ProductId,
        before: LifecycleState,
        now: DateTime<Utc>,
    ) -> Result<Reconciled, IntakeError> {
        let applied = self
            .orchestrator
            .apply(guard, id, LifecycleEvent::DeadlineExceeded, now)
            .await?;
        Ok(outcome(before, applied.product.state))
    }

    /// Feed the callbacks a completed transform never delivered through the
    /// classifier, in lifecycle order
    async fn replay(
        &self,
        guard: &ProductGuard,
        product: Product,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Reconciled, IntakeError> {
        let id = product.id;
        let before = product.state;
        let mut state = product.state;

        for kind in REPLAY_ORDER {
            if product.has_applied(kind) {
                continue;
            }

            let raw = match kind {
                CallbackKind::Metadata => metadata.clone(),
                other => synthesize(other, id),
            };
            let event = match raw {
                Some(raw) => match classify(&raw) {
                    Ok(event) if event.id() == id && event.kind() == kind => {
                        LifecycleEvent::Callback(event)
                    }
                    Ok(event) => LifecycleEvent::TransformFailed {
                        reason: format!(
                            "reported {} payload for product {} does not match",
                            event.kind(),
                            event.id()
                        ),
                    },
                    Err(rejected) => LifecycleEvent::TransformFailed {
                        reason: rejected.to_string(),
                    },
                },
                None => LifecycleEvent::TransformFailed {
                    reason: "transform completed without metadata".to_string(),
                },
            };

            debug!(product_id = %id, event = event.name(), "Replaying callback");
            state = self.orchestrator.apply(guard, id, event, now).await?.product.state;
            if state.is_terminal() {
                break;
            }
        }

        Ok(outcome(before, state))
    }
}

fn outcome(before: LifecycleState, after: LifecycleState) -> Reconciled {
    match after {
        LifecycleState::Failed if before != LifecycleState::Failed => Reconciled::Failed,
        LifecycleState::Promoted if before != LifecycleState::Promoted => Reconciled::Recovered,
        _ => Reconciled::Idle,
    }
}
