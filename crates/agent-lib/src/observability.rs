//! Observability infrastructure for the metadata agent
//!
//! Prometheus metrics for poll cycles, published resources, and lookup API
//! traffic, exposed through the API server's `/metrics` route.

use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};
use std::sync::OnceLock;

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    poll_cycles: IntCounterVec,
    poll_failures: IntCounterVec,
    resources_published: IntCounterVec,
    api_requests: IntCounterVec,
    store_resources: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            poll_cycles: register_int_counter_vec!(
                "metadata_agent_poll_cycles_total",
                "Poll cycles started, per updater",
                &["updater"]
            )
            .expect("Failed to register poll_cycles_total"),

            poll_failures: register_int_counter_vec!(
                "metadata_agent_poll_failures_total",
                "Failed poll cycles, per updater",
                &["updater"]
            )
            .expect("Failed to register poll_failures_total"),

            resources_published: register_int_counter_vec!(
                "metadata_agent_resources_published_total",
                "Resource metadata entries pushed into the store, per updater",
                &["updater"]
            )
            .expect("Failed to register resources_published_total"),

            api_requests: register_int_counter_vec!(
                "metadata_agent_api_requests_total",
                "Lookup API requests, per handler and status code",
                &["handler", "status"]
            )
            .expect("Failed to register api_requests_total"),

            store_resources: register_int_gauge!(
                "metadata_agent_store_resources",
                "Resources currently held in the metadata store"
            )
            .expect("Failed to register store_resources"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance. Multiple
/// clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &'static AgentMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn inc_poll_cycle(&self, updater: &str) {
        self.inner().poll_cycles.with_label_values(&[updater]).inc();
    }

    pub fn inc_poll_failure(&self, updater: &str) {
        self.inner()
            .poll_failures
            .with_label_values(&[updater])
            .inc();
    }

    pub fn add_resources_published(&self, updater: &str, count: usize) {
        self.inner()
            .resources_published
            .with_label_values(&[updater])
            .inc_by(count as u64);
    }

    pub fn inc_api_request(&self, handler: &str, status: u16) {
        self.inner()
            .api_requests
            .with_label_values(&[handler, &status.to_string()])
            .inc();
    }

    pub fn set_store_resources(&self, count: usize) {
        self.inner().store_resources.set(count as i64);
    }
}
