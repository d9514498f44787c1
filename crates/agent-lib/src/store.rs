//! In-memory metadata store
//!
//! Maps lookup aliases to monitored resources and monitored resources to
//! their latest metadata record. All mutation goes through a single lock
//! over both maps, so a reader can never observe a record whose resource
//! half is missing. An optional background sweeper evicts entries that
//! were not refreshed recently or carry a past expiry.

use crate::error::StoreError;
use crate::models::{MetadataRecord, MonitoredResource};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Change notifications delivered to subscribers after a write commits.
///
/// Callbacks run outside the write lock and must not call back into
/// mutating store methods.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// An alias was bound; `shadowed` is a previous binding to a different
    /// resource, if any.
    ResourceBound {
        alias: String,
        resource: MonitoredResource,
        shadowed: Option<MonitoredResource>,
    },
    /// A record was installed or replaced.
    MetadataUpdated { resource: MonitoredResource },
    /// A resource, its record, and all its aliases were evicted.
    ResourcePurged {
        resource: MonitoredResource,
        aliases: Vec<String>,
    },
}

pub type StoreCallback = Box<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    resource_map: HashMap<String, MonitoredResource>,
    metadata_map: HashMap<MonitoredResource, MetadataRecord>,
    last_collection: HashMap<MonitoredResource, DateTime<Utc>>,
}

impl StoreInner {
    /// Remove the record, the collection timestamp, and every alias of each
    /// given resource. Returns the evicted aliases per resource.
    fn evict(&mut self, resources: &[MonitoredResource]) -> Vec<(MonitoredResource, Vec<String>)> {
        let mut evicted = Vec::with_capacity(resources.len());
        for resource in resources {
            self.metadata_map.remove(resource);
            self.last_collection.remove(resource);
            let aliases: Vec<String> = self
                .resource_map
                .iter()
                .filter(|(_, r)| *r == resource)
                .map(|(alias, _)| alias.clone())
                .collect();
            for alias in &aliases {
                self.resource_map.remove(alias);
            }
            evicted.push((resource.clone(), aliases));
        }
        evicted
    }
}

/// Builder for [`MetadataStore`]. Change callbacks can only be registered
/// here, before the store is shared.
pub struct MetadataStoreBuilder {
    expire_after: Duration,
    expire_interval: Option<Duration>,
    callbacks: Vec<StoreCallback>,
}

impl MetadataStoreBuilder {
    pub fn new() -> Self {
        Self {
            expire_after: Duration::from_secs(600),
            expire_interval: None,
            callbacks: Vec::new(),
        }
    }

    /// Window after which an unrefreshed entry becomes eligible for eviction.
    pub fn expire_after(mut self, window: Duration) -> Self {
        self.expire_after = window;
        self
    }

    /// Sweep cadence; defaults to half of the expiry window.
    pub fn expire_interval(mut self, interval: Duration) -> Self {
        self.expire_interval = Some(interval);
        self
    }

    /// Subscribe to change notifications.
    pub fn on_change(mut self, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn build(self) -> MetadataStore {
        MetadataStore {
            inner: RwLock::new(StoreInner::default()),
            expire_after: self.expire_after,
            expire_interval: self.expire_interval,
            callbacks: self.callbacks,
        }
    }
}

impl Default for MetadataStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent mapping from lookup alias to monitored resource and from
/// monitored resource to its latest metadata record.
pub struct MetadataStore {
    inner: RwLock<StoreInner>,
    expire_after: Duration,
    expire_interval: Option<Duration>,
    callbacks: Vec<StoreCallback>,
}

impl MetadataStore {
    pub fn builder() -> MetadataStoreBuilder {
        MetadataStoreBuilder::new()
    }

    /// Bind each alias to the resource. A later binding for an alias wins;
    /// empty aliases are rejected individually, the rest of the batch still
    /// succeeds.
    pub async fn update_resource(&self, aliases: &[String], resource: MonitoredResource) {
        let mut events = Vec::with_capacity(aliases.len());
        {
            let mut inner = self.inner.write().await;
            for alias in aliases {
                if alias.is_empty() {
                    warn!(
                        resource_type = %resource.type_,
                        "Rejecting empty alias"
                    );
                    continue;
                }
                let shadowed = inner
                    .resource_map
                    .insert(alias.clone(), resource.clone())
                    .filter(|previous| *previous != resource);
                if shadowed.is_some() {
                    debug!(alias = %alias, "Alias rebound to a different resource");
                }
                events.push(StoreEvent::ResourceBound {
                    alias: alias.clone(),
                    resource: resource.clone(),
                    shadowed,
                });
            }
        }
        self.notify(&events);
    }

    /// Install the record for the resource unless it conflicts with the one
    /// already stored: records older than the stored `collected_at` are
    /// dropped, and on equal timestamps a tombstone wins while a
    /// non-tombstone never displaces a tombstone.
    pub async fn update_metadata(&self, resource: MonitoredResource, record: MetadataRecord) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().await;
            let supersedes = match inner.metadata_map.get(&resource) {
                Some(current) => {
                    record.collected_at > current.collected_at
                        || (record.collected_at == current.collected_at
                            && (record.is_deleted || !current.is_deleted))
                }
                None => true,
            };
            if !supersedes {
                debug!(
                    resource_type = %resource.type_,
                    "Dropping stale metadata record"
                );
                return;
            }
            inner.last_collection.insert(resource.clone(), Utc::now());
            inner.metadata_map.insert(resource.clone(), record);
            events.push(StoreEvent::MetadataUpdated { resource });
        }
        self.notify(&events);
    }

    /// Resolve an alias to its resource.
    pub async fn lookup_resource(&self, alias: &str) -> Result<MonitoredResource, StoreError> {
        let inner = self.inner.read().await;
        inner
            .resource_map
            .get(alias)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(alias.to_string()))
    }

    /// Consistent point-in-time copy of the resource-to-record map.
    pub async fn get_metadata_map(&self) -> HashMap<MonitoredResource, MetadataRecord> {
        self.inner.read().await.metadata_map.clone()
    }

    /// Number of resources with a stored record.
    pub async fn record_count(&self) -> usize {
        self.inner.read().await.metadata_map.len()
    }

    /// Remove tombstoned records and records whose own expiry has passed,
    /// together with all aliases of the removed resources.
    pub async fn purge_deleted_entries(&self) {
        self.purge_at(Utc::now()).await;
    }

    async fn purge_at(&self, now: DateTime<Utc>) {
        self.evict_where(|record, _| record.is_deleted || record.is_expired_at(now))
            .await;
    }

    /// Evict entries not refreshed within the expiry window, plus records
    /// whose own expiry has passed.
    async fn expire_at(&self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.expire_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        self.evict_where(|record, last| {
            record.is_expired_at(now)
                || last.is_none_or(|t| now.signed_duration_since(t) > window)
        })
        .await;
    }

    async fn evict_where<F>(&self, eligible: F)
    where
        F: Fn(&MetadataRecord, Option<DateTime<Utc>>) -> bool,
    {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().await;
            let doomed: Vec<MonitoredResource> = inner
                .metadata_map
                .iter()
                .filter(|&(resource, record)| {
                    eligible(record, inner.last_collection.get(resource).copied())
                })
                .map(|(resource, _)| resource.clone())
                .collect();
            for (resource, aliases) in inner.evict(&doomed) {
                debug!(
                    resource_type = %resource.type_,
                    aliases = aliases.len(),
                    "Evicted resource"
                );
                events.push(StoreEvent::ResourcePurged { resource, aliases });
            }
        }
        self.notify(&events);
    }

    /// Periodically evict stale and tombstoned entries until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self
            .expire_interval
            .unwrap_or(self.expire_after / 2)
            .max(Duration::from_secs(1));
        info!(period_secs = period.as_secs(), "Starting store sweeper");

        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; there is nothing to sweep yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    self.purge_at(now).await;
                    self.expire_at(now).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down store sweeper");
                    break;
                }
            }
        }
    }

    fn notify(&self, events: &[StoreEvent]) {
        for event in events {
            for callback in &self.callbacks {
                callback(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn resource(id: &str) -> MonitoredResource {
        MonitoredResource::new("docker_container", [("container_id", id)])
    }

    fn record_at(collected_at: DateTime<Utc>, is_deleted: bool) -> MetadataRecord {
        MetadataRecord {
            version: "0.1".to_string(),
            created_at: collected_at,
            collected_at,
            is_deleted,
            raw_content: serde_json::Value::Null,
            expires_at: None,
        }
    }

    fn aliases(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_lookup_returns_latest_binding() {
        let store = MetadataStore::builder().build();
        let first = resource("abc");
        let second = resource("def");

        store.update_resource(&aliases(&["shared"]), first).await;
        store
            .update_resource(&aliases(&["shared"]), second.clone())
            .await;

        assert_eq!(store.lookup_resource("shared").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_lookup_unknown_alias() {
        let store = MetadataStore::builder().build();
        assert_eq!(
            store.lookup_resource("nope").await,
            Err(StoreError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_multiple_aliases_map_to_one_resource() {
        let store = MetadataStore::builder().build();
        let full = "a".repeat(64);
        let container = resource(&full);

        store
            .update_resource(&aliases(&[&full, &full[..12]]), container.clone())
            .await;

        assert_eq!(store.lookup_resource(&full).await.unwrap(), container);
        assert_eq!(store.lookup_resource(&full[..12]).await.unwrap(), container);
    }

    #[tokio::test]
    async fn test_empty_alias_rejected_others_succeed() {
        let store = MetadataStore::builder().build();
        let container = resource("abc");

        store
            .update_resource(&aliases(&["", "abc"]), container.clone())
            .await;

        assert_eq!(store.lookup_resource("abc").await.unwrap(), container);
        assert!(store.lookup_resource("").await.is_err());
    }

    #[tokio::test]
    async fn test_update_resource_idempotent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let store = MetadataStore::builder()
            .on_change(move |event| {
                if let StoreEvent::ResourceBound { shadowed, .. } = event {
                    seen_cb.lock().unwrap().push(shadowed.clone());
                }
            })
            .build();
        let container = resource("abc");

        store
            .update_resource(&aliases(&["abc"]), container.clone())
            .await;
        store
            .update_resource(&aliases(&["abc"]), container.clone())
            .await;

        assert_eq!(store.lookup_resource("abc").await.unwrap(), container);
        // Rebinding to the same resource is not reported as shadowing
        assert_eq!(seen.lock().unwrap().as_slice(), &[None, None]);
    }

    #[tokio::test]
    async fn test_shadowed_binding_reported() {
        let shadowed = Arc::new(Mutex::new(Vec::new()));
        let shadowed_cb = shadowed.clone();
        let store = MetadataStore::builder()
            .on_change(move |event| {
                if let StoreEvent::ResourceBound {
                    shadowed: Some(previous),
                    ..
                } = event
                {
                    shadowed_cb.lock().unwrap().push(previous.clone());
                }
            })
            .build();

        store
            .update_resource(&aliases(&["shared"]), resource("abc"))
            .await;
        store
            .update_resource(&aliases(&["shared"]), resource("def"))
            .await;

        assert_eq!(shadowed.lock().unwrap().as_slice(), &[resource("abc")]);
    }

    #[tokio::test]
    async fn test_older_record_dropped() {
        let store = MetadataStore::builder().build();
        let container = resource("abc");
        let now = Utc::now();

        let newer = record_at(now, false);
        store
            .update_metadata(container.clone(), newer.clone())
            .await;
        store
            .update_metadata(
                container.clone(),
                record_at(now - chrono::Duration::seconds(1), false),
            )
            .await;

        let snapshot = store.get_metadata_map().await;
        assert_eq!(snapshot.get(&container), Some(&newer));
    }

    #[tokio::test]
    async fn test_tombstone_supersedes_at_equal_timestamp() {
        let store = MetadataStore::builder().build();
        let container = resource("abc");
        let t10 = Utc::now();

        // R1 live at t=10, R2 tombstone at t=10, R3 live at t=9
        store
            .update_metadata(container.clone(), record_at(t10, false))
            .await;
        store
            .update_metadata(container.clone(), record_at(t10, true))
            .await;
        store
            .update_metadata(
                container.clone(),
                record_at(t10 - chrono::Duration::seconds(1), false),
            )
            .await;

        let snapshot = store.get_metadata_map().await;
        assert!(snapshot.get(&container).unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_live_record_never_displaces_tombstone_at_equal_timestamp() {
        let store = MetadataStore::builder().build();
        let container = resource("abc");
        let t10 = Utc::now();

        store
            .update_metadata(container.clone(), record_at(t10, true))
            .await;
        store
            .update_metadata(container.clone(), record_at(t10, false))
            .await;

        let snapshot = store.get_metadata_map().await;
        assert!(snapshot.get(&container).unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_purge_removes_tombstones_and_their_aliases() {
        let store = MetadataStore::builder().build();
        let doomed = resource("abc");
        let kept = resource("def");
        let now = Utc::now();

        store
            .update_resource(&aliases(&["abc", "abc-short"]), doomed.clone())
            .await;
        store
            .update_metadata(doomed.clone(), record_at(now, true))
            .await;
        store.update_resource(&aliases(&["def"]), kept.clone()).await;
        store
            .update_metadata(kept.clone(), record_at(now, false))
            .await;

        store.purge_deleted_entries().await;

        let snapshot = store.get_metadata_map().await;
        assert!(!snapshot.contains_key(&doomed));
        assert!(snapshot.contains_key(&kept));
        assert!(store.lookup_resource("abc").await.is_err());
        assert!(store.lookup_resource("abc-short").await.is_err());
        assert_eq!(store.lookup_resource("def").await.unwrap(), kept);
    }

    #[tokio::test]
    async fn test_purge_honors_expires_at_equal_to_now() {
        let store = MetadataStore::builder().build();
        let container = resource("abc");
        let now = Utc::now();

        let mut record = record_at(now, false);
        record.expires_at = Some(now);
        store.update_metadata(container.clone(), record).await;

        store.purge_at(now).await;

        assert!(store.get_metadata_map().await.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_evicts_stale_entries_and_aliases() {
        let store = MetadataStore::builder()
            .expire_after(Duration::from_secs(60))
            .build();
        let container = resource("abc");
        let now = Utc::now();

        store
            .update_resource(&aliases(&["abc", "abc-short"]), container.clone())
            .await;
        store
            .update_metadata(container.clone(), record_at(now, false))
            .await;

        // Refreshed just now, a sweep 61 seconds later evicts everything
        store.expire_at(now + chrono::Duration::seconds(61)).await;

        assert!(store.get_metadata_map().await.is_empty());
        assert!(store.lookup_resource("abc").await.is_err());
        assert!(store.lookup_resource("abc-short").await.is_err());
    }

    #[tokio::test]
    async fn test_expiry_keeps_fresh_entries() {
        let store = MetadataStore::builder()
            .expire_after(Duration::from_secs(60))
            .build();
        let container = resource("abc");
        let now = Utc::now();

        store.update_resource(&aliases(&["abc"]), container.clone()).await;
        store
            .update_metadata(container.clone(), record_at(now, false))
            .await;

        store.expire_at(now + chrono::Duration::seconds(30)).await;

        assert!(store.get_metadata_map().await.contains_key(&container));
        assert!(store.lookup_resource("abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_sweeper_purges_on_configured_interval() {
        let store = Arc::new(
            MetadataStore::builder()
                .expire_after(Duration::from_secs(600))
                .expire_interval(Duration::from_secs(1))
                .build(),
        );
        let container = resource("abc");

        store
            .update_resource(&aliases(&["abc"]), container.clone())
            .await;
        store
            .update_metadata(container, record_at(Utc::now(), true))
            .await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = tokio::spawn(store.clone().run_sweeper(shutdown_tx.subscribe()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.lookup_resource("abc").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("sweeper did not purge the tombstone");

        let _ = shutdown_tx.send(());
        let _ = sweeper.await;
    }

    #[tokio::test]
    async fn test_callbacks_fire_per_update() {
        let updates = Arc::new(AtomicUsize::new(0));
        let updates_cb = updates.clone();
        let store = MetadataStore::builder()
            .on_change(move |event| {
                if matches!(event, StoreEvent::MetadataUpdated { .. }) {
                    updates_cb.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();
        let container = resource("abc");
        let now = Utc::now();

        store
            .update_metadata(container.clone(), record_at(now, false))
            .await;
        // Conflicting older record: dropped, no callback
        store
            .update_metadata(
                container,
                record_at(now - chrono::Duration::seconds(5), false),
            )
            .await;

        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }
}
