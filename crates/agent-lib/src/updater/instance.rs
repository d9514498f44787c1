//! Host instance discovery
//!
//! Queries the VM metadata service for the host's stable identity and
//! publishes it under the instance id and hostname aliases.

use super::PollSource;
use crate::config::AgentConfig;
use crate::error::QueryError;
use crate::models::{MetadataRecord, MonitoredResource, ResourceMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity fields harvested from the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub project_id: String,
    pub instance_id: String,
    pub zone: String,
    pub hostname: String,
}

pub struct InstancePoller {
    config: Arc<AgentConfig>,
    endpoint: String,
    client: reqwest::Client,
}

impl InstancePoller {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self::with_endpoint(config, DEFAULT_METADATA_ENDPOINT)
    }

    /// Custom metadata endpoint, for tests.
    pub fn with_endpoint(config: Arc<AgentConfig>, endpoint: impl Into<String>) -> Self {
        Self {
            config,
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<String, QueryError> {
        let url = format!("{}/computeMetadata/v1/{}", self.endpoint, path);
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(QueryError::transient)?;

        let status = response.status();
        if status.is_client_error() {
            return Err(QueryError::permanent(anyhow::anyhow!(
                "metadata service rejected {path}: {status}"
            )));
        }
        if !status.is_success() {
            return Err(QueryError::transient(anyhow::anyhow!(
                "metadata service returned {status} for {path}"
            )));
        }
        response.text().await.map_err(QueryError::transient)
    }

    fn build_entry(&self, identity: InstanceIdentity, now: DateTime<Utc>) -> ResourceMetadata {
        let resource = MonitoredResource::new(
            self.config.instance_resource_type.clone(),
            [
                ("project_id", identity.project_id.as_str()),
                ("instance_id", identity.instance_id.as_str()),
                ("zone", identity.zone.as_str()),
            ],
        );
        let record = MetadataRecord {
            version: self
                .config
                .metadata_ingestion_raw_content_version
                .clone(),
            created_at: now,
            collected_at: now,
            is_deleted: false,
            raw_content: json!({
                "project_id": identity.project_id,
                "instance_id": identity.instance_id,
                "zone": identity.zone,
                "hostname": identity.hostname,
            }),
            expires_at: None,
        };
        ResourceMetadata::new(
            vec![identity.instance_id, identity.hostname],
            resource,
            record,
        )
    }
}

/// The metadata service reports zones fully qualified, as
/// `projects/{number}/zones/{zone}`.
fn zone_name(qualified: &str) -> &str {
    qualified.rsplit('/').next().unwrap_or(qualified)
}

#[async_trait]
impl PollSource for InstancePoller {
    fn name(&self) -> &'static str {
        crate::health::components::INSTANCE
    }

    async fn query(&self) -> Result<Vec<ResourceMetadata>, QueryError> {
        let project_id = self.fetch("project/project-id").await?;
        let instance_id = self.fetch("instance/id").await?;
        let zone = self.fetch("instance/zone").await?;
        let hostname = self.fetch("instance/hostname").await?;

        let identity = InstanceIdentity {
            project_id: project_id.trim().to_string(),
            instance_id: instance_id.trim().to_string(),
            zone: zone_name(zone.trim()).to_string(),
            hostname: hostname.trim().to_string(),
        };

        Ok(vec![self.build_entry(identity, Utc::now())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> InstanceIdentity {
        InstanceIdentity {
            project_id: "my-project".to_string(),
            instance_id: "42".to_string(),
            zone: "us-central1-a".to_string(),
            hostname: "host.local".to_string(),
        }
    }

    #[test]
    fn test_zone_name_strips_qualifier() {
        assert_eq!(zone_name("projects/123/zones/us-central1-a"), "us-central1-a");
        assert_eq!(zone_name("us-central1-a"), "us-central1-a");
    }

    #[test]
    fn test_entry_uses_configured_resource_type() {
        let mut config = AgentConfig::default();
        config.instance_resource_type = "aws_ec2_instance".to_string();
        let poller = InstancePoller::new(Arc::new(config));

        let entry = poller.build_entry(identity(), Utc::now());
        assert_eq!(entry.resource.type_, "aws_ec2_instance");
    }

    #[test]
    fn test_entry_ids_and_labels() {
        let poller = InstancePoller::new(Arc::new(AgentConfig::default()));

        let entry = poller.build_entry(identity(), Utc::now());

        assert_eq!(entry.ids, vec!["42", "host.local"]);
        assert_eq!(entry.resource.type_, "gce_instance");
        assert_eq!(entry.resource.labels["instance_id"], "42");
        assert_eq!(entry.resource.labels["zone"], "us-central1-a");
        assert_eq!(entry.resource.labels["project_id"], "my-project");
        assert!(!entry.record.is_deleted);
        assert_eq!(entry.record.version, "0.1");
        assert_eq!(entry.record.raw_content["hostname"], "host.local");
    }
}
