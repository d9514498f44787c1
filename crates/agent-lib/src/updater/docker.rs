//! Container runtime discovery
//!
//! Lists containers from the Docker Engine API and remembers which ids the
//! previous poll saw, so containers that disappeared get tombstone records.

use super::PollSource;
use crate::config::AgentConfig;
use crate::error::QueryError;
use crate::models::{MetadataRecord, MonitoredResource, ResourceMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_ID_LEN: usize = 12;

/// Subset of the container list payload the agent consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Created", default)]
    pub created: i64,
    #[serde(rename = "State", default)]
    pub state: String,
}

impl ContainerSummary {
    /// The primary name, without the leading slash the runtime prepends.
    fn name(&self) -> Option<&str> {
        self.names
            .first()
            .map(|name| name.strip_prefix('/').unwrap_or(name))
    }
}

pub struct DockerPoller {
    config: Arc<AgentConfig>,
    client: reqwest::Client,
    /// Resources seen by the previous poll, keyed by full container id.
    previous: Mutex<HashMap<String, MonitoredResource>>,
}

impl DockerPoller {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            previous: Mutex::new(HashMap::new()),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, QueryError> {
        let url = format!(
            "{}/v{}/containers/json",
            self.config.docker_endpoint_host.trim_end_matches('/'),
            self.config.docker_api_version
        );
        let mut request = self
            .client
            .get(&url)
            .query(&[("all", "true")])
            .timeout(REQUEST_TIMEOUT);
        if !self.config.docker_container_filter.is_empty() {
            request = request.query(&[("filters", self.config.docker_container_filter.as_str())]);
        }

        let response = request.send().await.map_err(QueryError::transient)?;
        let status = response.status();
        if status.is_client_error() {
            return Err(QueryError::permanent(anyhow::anyhow!(
                "container runtime rejected the list call: {status}"
            )));
        }
        if !status.is_success() {
            return Err(QueryError::transient(anyhow::anyhow!(
                "container runtime returned {status}"
            )));
        }
        response.json().await.map_err(QueryError::transient)
    }

    fn container_entry(
        &self,
        summary: &ContainerSummary,
        now: DateTime<Utc>,
    ) -> ResourceMetadata {
        let name = summary.name().unwrap_or(&summary.id);
        let resource = MonitoredResource::new(
            "docker_container",
            [
                ("container_id", summary.id.as_str()),
                ("container_name", name),
            ],
        );

        let mut ids = vec![summary.id.clone(), short_id(&summary.id).to_string()];
        if name != summary.id {
            ids.push(name.to_string());
        }

        let record = MetadataRecord {
            version: self
                .config
                .metadata_ingestion_raw_content_version
                .clone(),
            created_at: DateTime::from_timestamp(summary.created, 0).unwrap_or(now),
            collected_at: now,
            is_deleted: false,
            raw_content: json!({
                "id": summary.id,
                "name": name,
                "created": summary.created,
                "state": summary.state,
            }),
            expires_at: None,
        };
        ResourceMetadata::new(ids, resource, record)
    }

    fn tombstone(
        &self,
        id: &str,
        resource: MonitoredResource,
        now: DateTime<Utc>,
    ) -> ResourceMetadata {
        let record = MetadataRecord {
            version: self
                .config
                .metadata_ingestion_raw_content_version
                .clone(),
            created_at: now,
            collected_at: now,
            is_deleted: true,
            raw_content: serde_json::Value::Null,
            expires_at: None,
        };
        ResourceMetadata::new(vec![id.to_string()], resource, record)
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

#[async_trait]
impl PollSource for DockerPoller {
    fn name(&self) -> &'static str {
        crate::health::components::DOCKER
    }

    fn validate(&self) -> bool {
        self.config.docker_updater_enabled
            && !self.config.docker_api_version.is_empty()
            && url::Url::parse(&self.config.docker_endpoint_host).is_ok()
    }

    async fn query(&self) -> Result<Vec<ResourceMetadata>, QueryError> {
        let containers = self.list_containers().await?;
        let now = Utc::now();

        let mut batch = Vec::new();
        let mut current = HashMap::new();
        for summary in containers.iter().filter(|c| c.state == "running") {
            let entry = self.container_entry(summary, now);
            current.insert(summary.id.clone(), entry.resource.clone());
            batch.push(entry);
        }

        let mut previous = self.previous.lock().await;
        for (id, resource) in previous.iter() {
            if !current.contains_key(id) {
                debug!(container_id = %id, "Container gone, emitting tombstone");
                batch.push(self.tombstone(id, resource.clone(), now));
            }
        }
        *previous = current;

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, name: &str, state: &str) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{name}")],
            created: 1_500_000_000,
            state: state.to_string(),
        }
    }

    fn poller() -> DockerPoller {
        DockerPoller::new(Arc::new(AgentConfig::default()))
    }

    #[test]
    fn test_short_id() {
        let full = "a".repeat(64);
        assert_eq!(short_id(&full), "a".repeat(12));
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_validate_respects_enable_flag() {
        let mut config = AgentConfig::default();
        config.docker_updater_enabled = false;
        let poller = DockerPoller::new(Arc::new(config));
        assert!(!poller.validate());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let mut config = AgentConfig::default();
        config.docker_endpoint_host = "not a url".to_string();
        let poller = DockerPoller::new(Arc::new(config));
        assert!(!poller.validate());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(poller().validate());
    }

    #[test]
    fn test_container_entry() {
        let full = "f".repeat(64);
        let entry = poller().container_entry(&summary(&full, "web", "running"), Utc::now());

        assert_eq!(entry.resource.type_, "docker_container");
        assert_eq!(entry.resource.labels["container_id"], full);
        assert_eq!(entry.resource.labels["container_name"], "web");
        assert_eq!(
            entry.ids,
            vec![full.clone(), "f".repeat(12), "web".to_string()]
        );
        assert!(!entry.record.is_deleted);
        assert_eq!(entry.record.raw_content["state"], "running");
    }

    #[test]
    fn test_container_list_payload_parses() {
        let body = r#"[{"Id":"abc123","Names":["/web"],"Created":1500000000,"State":"running"}]"#;
        let containers: Vec<ContainerSummary> = serde_json::from_str(body).unwrap();

        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "abc123");
        assert_eq!(containers[0].name(), Some("web"));
    }

    #[tokio::test]
    async fn test_disappeared_container_gets_tombstone() {
        let poller = poller();
        let gone = "b".repeat(64);
        let resource = MonitoredResource::new("docker_container", [("container_id", gone.as_str())]);
        poller
            .previous
            .lock()
            .await
            .insert(gone.clone(), resource.clone());

        let tombstone = poller.tombstone(&gone, resource.clone(), Utc::now());
        assert!(tombstone.record.is_deleted);
        assert_eq!(tombstone.ids, vec![gone]);
        assert_eq!(tombstone.resource, resource);
    }
}
