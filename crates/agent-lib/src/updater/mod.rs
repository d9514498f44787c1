//! Updater framework
//!
//! A generic lifecycle driver around poll sources: validate the relevant
//! configuration, spawn one worker that queries on a fixed period with a
//! cancellable sleep, publish the results into the store, and report
//! terminal failures to the health checker. Sources only describe how to
//! discover entities; the driver owns the lifecycle so a source cannot
//! forget to report.

mod docker;
mod instance;
mod kubernetes;

pub use docker::DockerPoller;
pub use instance::InstancePoller;
pub use kubernetes::KubernetesPoller;

use crate::error::QueryError;
use crate::health::HealthChecker;
use crate::models::ResourceMetadata;
use crate::observability::AgentMetrics;
use crate::store::MetadataStore;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive transient failures tolerated before an updater reports
/// itself unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// A discovery source driven by [`PollingUpdater`].
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Stable name, used for logging and health reporting.
    fn name(&self) -> &'static str;

    /// Checks the slice of configuration this source owns. Returning false
    /// disables the updater without failing the agent.
    fn validate(&self) -> bool {
        true
    }

    /// Produce one batch of discovered entities.
    async fn query(&self) -> Result<Vec<ResourceMetadata>, QueryError>;
}

/// Lifecycle states of an updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    New,
    Started,
    /// Validation failed; the updater makes no queries. This is normal for
    /// sources that are not configured on this host.
    Disabled,
    /// A terminal failure was reported to the health checker.
    Unhealthy,
    Stopped,
}

/// Periodic driver for a [`PollSource`].
///
/// Within one batch, a resource's aliases are registered before its record
/// is installed; across batches there is no ordering.
pub struct PollingUpdater {
    source: Arc<dyn PollSource>,
    store: Arc<MetadataStore>,
    health: HealthChecker,
    metrics: AgentMetrics,
    period: Duration,
    failure_threshold: u32,
    state: Arc<Mutex<UpdaterState>>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingUpdater {
    pub fn new(
        source: Arc<dyn PollSource>,
        store: Arc<MetadataStore>,
        health: HealthChecker,
        period: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            source,
            store,
            health,
            metrics: AgentMetrics::new(),
            period,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            state: Arc::new(Mutex::new(UpdaterState::New)),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn name(&self) -> &'static str {
        self.source.name()
    }

    pub async fn state(&self) -> UpdaterState {
        *self.state.lock().await
    }

    /// Validate the source's configuration and spawn the worker. May only
    /// be called once; a failed validation disables the updater and is not
    /// an error.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        anyhow::ensure!(
            *state == UpdaterState::New,
            "updater {} already started",
            self.name()
        );

        if self.period.is_zero() || !self.source.validate() {
            info!(updater = self.name(), "Validation failed, updater disabled");
            *state = UpdaterState::Disabled;
            return Ok(());
        }
        *state = UpdaterState::Started;
        drop(state);

        let handle = tokio::spawn(run_worker(
            self.source.clone(),
            self.store.clone(),
            self.health.clone(),
            self.metrics.clone(),
            self.state.clone(),
            self.period,
            self.failure_threshold,
            self.shutdown_tx.subscribe(),
        ));
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    /// Cancel the worker's sleep and join it. Idempotent; returns within
    /// `min(2 x period, 30s)` even if the worker is stuck in a query.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());

        let handle = self.worker.lock().await.take();
        if let Some(mut handle) = handle {
            let grace = self.period.saturating_mul(2).min(Duration::from_secs(30));
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    updater = self.name(),
                    "Worker did not exit within the grace period, aborting"
                );
                handle.abort();
            }
        }

        let mut state = self.state.lock().await;
        if !matches!(*state, UpdaterState::New | UpdaterState::Disabled) {
            *state = UpdaterState::Stopped;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    source: Arc<dyn PollSource>,
    store: Arc<MetadataStore>,
    health: HealthChecker,
    metrics: AgentMetrics,
    state: Arc<Mutex<UpdaterState>>,
    period: Duration,
    failure_threshold: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let name = source.name();
    info!(
        updater = name,
        period_secs = period.as_secs(),
        "Starting polling worker"
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics.inc_poll_cycle(name);
                match source.query().await {
                    Ok(batch) => {
                        consecutive_failures = 0;
                        let entries = batch.len();
                        for item in batch {
                            // Register the aliases before installing the
                            // record, so a reader that sees the record can
                            // always resolve at least one alias.
                            store.update_resource(&item.ids, item.resource.clone()).await;
                            store.update_metadata(item.resource, item.record).await;
                        }
                        metrics.add_resources_published(name, entries);
                        metrics.set_store_resources(store.record_count().await);
                        debug!(updater = name, entries, "Poll cycle complete");
                    }
                    Err(QueryError::Transient(e)) => {
                        consecutive_failures += 1;
                        metrics.inc_poll_failure(name);
                        warn!(
                            updater = name,
                            error = %e,
                            failures = consecutive_failures,
                            "Transient query failure"
                        );
                        if consecutive_failures >= failure_threshold {
                            *state.lock().await = UpdaterState::Unhealthy;
                            health.set_unhealthy(name).await;
                        }
                    }
                    Err(QueryError::Permanent(e)) => {
                        metrics.inc_poll_failure(name);
                        error!(updater = name, error = %e, "Permanent query failure, giving up");
                        *state.lock().await = UpdaterState::Unhealthy;
                        health.set_unhealthy(name).await;
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!(updater = name, "Polling worker cancelled");
                break;
            }
        }
    }
}
