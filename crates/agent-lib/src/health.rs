//! Health check infrastructure for the metadata agent
//!
//! A named-failure registry: updaters report terminal failures under their
//! own name, and the agent is healthy while the set stays empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names updaters report under.
pub mod components {
    pub const INSTANCE: &str = "instance";
    pub const DOCKER: &str = "docker";
    pub const KUBERNETES: &str = "kubernetes";
}

/// Serializable snapshot of the registry for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub failing: Vec<String>,
}

/// Shared registry of failing component names.
///
/// Cloning is cheap; all clones share the same set. Entries are never
/// removed: a component that failed terminally stays failed until the
/// process restarts.
#[derive(Debug, Clone, Default)]
pub struct HealthChecker {
    failing: Arc<RwLock<BTreeSet<String>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal failure for the named component.
    pub async fn set_unhealthy(&self, name: &str) {
        let mut failing = self.failing.write().await;
        failing.insert(name.to_string());
    }

    /// True iff no component has reported a terminal failure.
    pub async fn is_healthy(&self) -> bool {
        self.failing.read().await.is_empty()
    }

    /// Names of all components that reported terminal failures.
    pub async fn failing_names(&self) -> BTreeSet<String> {
        self.failing.read().await.clone()
    }

    /// Snapshot for the health endpoint.
    pub async fn response(&self) -> HealthResponse {
        let failing = self.failing.read().await;
        HealthResponse {
            healthy: failing.is_empty(),
            failing: failing.iter().cloned().collect(),
        }
    }
}
