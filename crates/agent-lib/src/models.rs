//! Core data models for the metadata agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed identity for a compute entity observable by telemetry pipelines.
///
/// Labels are kept in a `BTreeMap` so the JSON form always serializes with
/// the same key order. Two resources are equal iff type and labels match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub type_: String,
    pub labels: BTreeMap<String, String>,
}

impl MonitoredResource {
    /// Build a resource from a type tag and label pairs.
    pub fn new<T, K, V, I>(type_: T, labels: I) -> Self
    where
        T: Into<String>,
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            type_: type_.into(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The time-stamped payload associated with a monitored resource.
///
/// A record with `is_deleted` set is a tombstone: the underlying entity no
/// longer exists upstream. Once handed to the store the record is owned by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Schema tag of `raw_content`.
    pub version: String,
    /// When the underlying entity began.
    pub created_at: DateTime<Utc>,
    /// When the agent observed the record.
    pub collected_at: DateTime<Utc>,
    pub is_deleted: bool,
    /// Opaque structured payload, rendered as JSON on output.
    pub raw_content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MetadataRecord {
    /// True once the record's own expiry time has been reached.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// One discovered entity as produced by a poll source: the aliases it can be
/// looked up by, its canonical resource, and the record to install.
#[derive(Debug, Clone)]
pub struct ResourceMetadata {
    pub ids: Vec<String>,
    pub resource: MonitoredResource,
    pub record: MetadataRecord,
}

impl ResourceMetadata {
    pub fn new(ids: Vec<String>, resource: MonitoredResource, record: MetadataRecord) -> Self {
        Self {
            ids,
            resource,
            record,
        }
    }
}
