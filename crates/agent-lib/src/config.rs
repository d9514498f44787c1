//! Agent configuration
//!
//! All recognized options with their documented defaults, loaded from the
//! environment under the `METADATA_AGENT_` prefix. An override that does
//! not parse at all is a fatal startup error; the configuration is
//! read-only after that point, and updaters validate the slice of it they
//! own, disabling themselves on semantically invalid values rather than
//! failing the agent.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Emit per-request and per-poll debug lines.
    #[serde(default)]
    pub verbose_logging: bool,

    /// Worker threads for the lookup API server.
    #[serde(default = "default_api_num_threads")]
    pub metadata_api_num_threads: usize,

    #[serde(default = "default_api_bind_host")]
    pub metadata_api_bind_host: String,

    #[serde(default = "default_api_bind_port")]
    pub metadata_api_bind_port: u16,

    /// Default `version` tag on emitted records.
    #[serde(default = "default_raw_content_version")]
    pub metadata_ingestion_raw_content_version: String,

    /// Default poller period.
    #[serde(default = "default_reporter_interval")]
    pub metadata_reporter_interval_seconds: u64,

    /// Whether the store sweeper runs.
    #[serde(default)]
    pub metadata_reporter_purge_deleted: bool,

    /// Entries not refreshed within this window are evicted by the sweeper.
    #[serde(default = "default_store_expire")]
    pub metadata_store_expire_seconds: u64,

    /// Sweep cadence; unset means half the expiry window.
    #[serde(default)]
    pub metadata_store_expire_interval_seconds: Option<u64>,

    /// Tag used for the host resource.
    #[serde(default = "default_instance_resource_type")]
    pub instance_resource_type: String,

    #[serde(default = "default_true")]
    pub docker_updater_enabled: bool,

    #[serde(default = "default_docker_endpoint")]
    pub docker_endpoint_host: String,

    #[serde(default = "default_docker_api_version")]
    pub docker_api_version: String,

    /// Optional filter expression passed through to the container list call.
    #[serde(default)]
    pub docker_container_filter: String,

    #[serde(default)]
    pub kubernetes_updater_enabled: bool,

    /// API server endpoint; empty means in-cluster discovery via
    /// `KUBERNETES_SERVICE_HOST`.
    #[serde(default)]
    pub kubernetes_endpoint_host: String,

    #[serde(default)]
    pub kubernetes_pod_label_selector: String,

    /// Node this agent runs on; pod discovery is scoped to it.
    #[serde(default)]
    pub kubernetes_node_name: String,

    #[serde(default = "default_service_account_directory")]
    pub kubernetes_service_account_directory: String,

    #[serde(default)]
    pub kubernetes_cluster_name: String,

    #[serde(default)]
    pub kubernetes_cluster_location: String,
}

fn default_api_num_threads() -> usize {
    3
}

fn default_api_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_bind_port() -> u16 {
    8000
}

fn default_raw_content_version() -> String {
    "0.1".to_string()
}

fn default_reporter_interval() -> u64 {
    60
}

fn default_store_expire() -> u64 {
    600
}

fn default_instance_resource_type() -> String {
    "gce_instance".to_string()
}

fn default_true() -> bool {
    true
}

fn default_docker_endpoint() -> String {
    "http://localhost:2375".to_string()
}

fn default_docker_api_version() -> String {
    "1.23".to_string()
}

fn default_service_account_directory() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            verbose_logging: false,
            metadata_api_num_threads: default_api_num_threads(),
            metadata_api_bind_host: default_api_bind_host(),
            metadata_api_bind_port: default_api_bind_port(),
            metadata_ingestion_raw_content_version: default_raw_content_version(),
            metadata_reporter_interval_seconds: default_reporter_interval(),
            metadata_reporter_purge_deleted: false,
            metadata_store_expire_seconds: default_store_expire(),
            metadata_store_expire_interval_seconds: None,
            instance_resource_type: default_instance_resource_type(),
            docker_updater_enabled: true,
            docker_endpoint_host: default_docker_endpoint(),
            docker_api_version: default_docker_api_version(),
            docker_container_filter: String::new(),
            kubernetes_updater_enabled: false,
            kubernetes_endpoint_host: String::new(),
            kubernetes_pod_label_selector: String::new(),
            kubernetes_node_name: String::new(),
            kubernetes_service_account_directory: default_service_account_directory(),
            kubernetes_cluster_name: String::new(),
            kubernetes_cluster_location: String::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment. A malformed override is a
    /// fatal startup error; missing options take their documented defaults.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("METADATA_AGENT").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn reporter_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_reporter_interval_seconds)
    }

    pub fn store_expire_after(&self) -> Duration {
        Duration::from_secs(self.metadata_store_expire_seconds)
    }

    pub fn store_expire_interval(&self) -> Option<Duration> {
        self.metadata_store_expire_interval_seconds
            .map(Duration::from_secs)
    }

    pub fn api_bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.metadata_api_bind_host, self.metadata_api_bind_port
        )
    }
}
