//! Agent library for local metadata discovery
//!
//! This crate provides the core functionality for:
//! - The concurrent metadata store with multi-alias lookup and expiry
//! - The polling updater lifecycle
//! - Host instance, container runtime, and Kubernetes pod discovery
//! - Health checks and observability

pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod store;
pub mod updater;

pub use config::AgentConfig;
pub use error::{QueryError, StoreError};
pub use health::{HealthChecker, HealthResponse};
pub use models::{MetadataRecord, MonitoredResource, ResourceMetadata};
pub use observability::AgentMetrics;
pub use store::{MetadataStore, StoreEvent};
pub use updater::{
    DockerPoller, InstancePoller, KubernetesPoller, PollSource, PollingUpdater, UpdaterState,
};
