//! Kubernetes pod discovery
//!
//! Lists pods scheduled on this node from the API server, authenticating
//! with the mounted service-account credentials. Disabled entirely unless
//! configured for this host.

use super::PollSource;
use crate::config::AgentConfig;
use crate::error::QueryError;
use crate::models::{MetadataRecord, MonitoredResource, ResourceMetadata};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
pub struct Pod {
    metadata: PodMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetadata {
    name: String,
    namespace: String,
    uid: String,
    #[serde(default)]
    creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

pub struct KubernetesPoller {
    config: Arc<AgentConfig>,
    client: OnceCell<reqwest::Client>,
    /// Resources seen by the previous poll, keyed by pod uid.
    previous: Mutex<HashMap<String, MonitoredResource>>,
}

impl KubernetesPoller {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            config,
            client: OnceCell::new(),
            previous: Mutex::new(HashMap::new()),
        }
    }

    /// The API server endpoint: the configured host, or the in-cluster
    /// service environment.
    fn endpoint(&self) -> Option<String> {
        if !self.config.kubernetes_endpoint_host.is_empty() {
            return Some(
                self.config
                    .kubernetes_endpoint_host
                    .trim_end_matches('/')
                    .to_string(),
            );
        }
        std::env::var("KUBERNETES_SERVICE_HOST").ok().map(|host| {
            let port =
                std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
            format!("https://{host}:{port}")
        })
    }

    fn service_account_path(&self, file: &str) -> PathBuf {
        Path::new(&self.config.kubernetes_service_account_directory).join(file)
    }

    /// Build the API client once, trusting the mounted CA bundle when it is
    /// present.
    async fn client(&self) -> anyhow::Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async {
                let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
                let ca_path = self.service_account_path("ca.crt");
                match tokio::fs::read(&ca_path).await {
                    Ok(pem) => {
                        let certificate = reqwest::Certificate::from_pem(&pem)
                            .with_context(|| format!("Invalid CA bundle at {ca_path:?}"))?;
                        builder = builder.add_root_certificate(certificate);
                    }
                    Err(e) => {
                        warn!(error = %e, "Service account CA bundle unavailable, using system roots");
                    }
                }
                builder.build().context("Failed to build Kubernetes API client")
            })
            .await
    }

    async fn list_node_pods(&self) -> Result<Vec<Pod>, QueryError> {
        let endpoint = self.endpoint().ok_or_else(|| {
            QueryError::transient(anyhow::anyhow!("Kubernetes API endpoint not resolvable"))
        })?;
        let token = tokio::fs::read_to_string(self.service_account_path("token"))
            .await
            .context("Failed to read service account token")
            .map_err(QueryError::transient)?;

        let client = self.client().await.map_err(QueryError::transient)?;
        let mut request = client
            .get(format!("{endpoint}/api/v1/pods"))
            .bearer_auth(token.trim())
            .query(&[(
                "fieldSelector",
                format!("spec.nodeName={}", self.config.kubernetes_node_name),
            )]);
        if !self.config.kubernetes_pod_label_selector.is_empty() {
            request = request.query(&[(
                "labelSelector",
                self.config.kubernetes_pod_label_selector.as_str(),
            )]);
        }

        let response = request.send().await.map_err(QueryError::transient)?;
        let status = response.status();
        if status.is_client_error() {
            return Err(QueryError::permanent(anyhow::anyhow!(
                "Kubernetes API rejected the pod list: {status}"
            )));
        }
        if !status.is_success() {
            return Err(QueryError::transient(anyhow::anyhow!(
                "Kubernetes API returned {status}"
            )));
        }

        let pods: PodList = response.json().await.map_err(QueryError::transient)?;
        Ok(pods.items)
    }

    fn pod_entry(&self, pod: &Pod, now: DateTime<Utc>) -> ResourceMetadata {
        let metadata = &pod.metadata;
        let resource = MonitoredResource::new(
            "k8s_pod",
            [
                (
                    "cluster_name",
                    self.config.kubernetes_cluster_name.as_str(),
                ),
                (
                    "location",
                    self.config.kubernetes_cluster_location.as_str(),
                ),
                ("namespace_name", metadata.namespace.as_str()),
                ("pod_name", metadata.name.as_str()),
            ],
        );
        let record = MetadataRecord {
            version: self
                .config
                .metadata_ingestion_raw_content_version
                .clone(),
            created_at: metadata.creation_timestamp.unwrap_or(now),
            collected_at: now,
            is_deleted: false,
            raw_content: serde_json::json!({
                "name": metadata.name,
                "namespace": metadata.namespace,
                "uid": metadata.uid,
                "labels": metadata.labels,
            }),
            expires_at: None,
        };
        ResourceMetadata::new(
            vec![metadata.uid.clone(), pod_alias(&metadata.namespace, &metadata.name)],
            resource,
            record,
        )
    }

    fn tombstone(
        &self,
        uid: &str,
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
        ResourceMetadata::new(vec![uid.to_string()], resource, record)
    }
}

fn pod_alias(namespace: &str, name: &str) -> String {
    format!("k8s_pod.{namespace}.{name}")
}

#[async_trait]
impl PollSource for KubernetesPoller {
    fn name(&self) -> &'static str {
        crate::health::components::KUBERNETES
    }

    fn validate(&self) -> bool {
        if !self.config.kubernetes_updater_enabled {
            return false;
        }
        if self.config.kubernetes_node_name.is_empty() {
            warn!("Kubernetes updater enabled but no node name configured");
            return false;
        }
        if !self.config.kubernetes_endpoint_host.is_empty()
            && url::Url::parse(&self.config.kubernetes_endpoint_host).is_err()
        {
            warn!(
                endpoint = %self.config.kubernetes_endpoint_host,
                "Invalid Kubernetes endpoint"
            );
            return false;
        }
        true
    }

    async fn query(&self) -> Result<Vec<ResourceMetadata>, QueryError> {
        let pods = self.list_node_pods().await?;
        let now = Utc::now();

        let mut batch = Vec::new();
        let mut current = HashMap::new();
        for pod in &pods {
            let entry = self.pod_entry(pod, now);
            current.insert(pod.metadata.uid.clone(), entry.resource.clone());
            batch.push(entry);
        }

        let mut previous = self.previous.lock().await;
        for (uid, resource) in previous.iter() {
            if !current.contains_key(uid) {
                debug!(uid = %uid, "Pod gone, emitting tombstone");
                batch.push(self.tombstone(uid, resource.clone(), now));
            }
        }
        *previous = current;

        Ok(batch)
    }
}
