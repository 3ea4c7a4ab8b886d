//! Catalog join: attaches parent title, size and metadata to raw events.
//!
//! Read-only. Running it twice over the same page gives the same output.
//!
//! Only the newest version of a catalog item sizes an event; history is kept
//! for audit and is never summed.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use tracing::trace;

use crate::config::{CatalogConfig, EventsConfig, VersionKeying};
use crate::error::StoreResult;
use crate::model::{AppMetadata, CatalogInfo, CatalogVersion, EnrichedEvent, RawEvent};
use crate::store::CatalogStore;

mod provider;

pub use provider::{
    from_config as provider_from_config, parse_metadata, LiveMetadataProvider,
    MetadataProvider, MirrorMetadataProvider,
};

pub struct CatalogJoin {
    catalog: Arc<dyn CatalogStore>,
    metadata: Arc<dyn MetadataProvider>,
    source_tag: String,
    keying: VersionKeying,
}

/// Per-call memo so a page full of chunks from one title costs one lookup.
#[derive(Default)]
struct JoinCache {
    parents: AHashMap<u32, Option<u32>>,
    versions: AHashMap<u32, Option<CatalogVersion>>,
    metadata: AHashMap<u32, Option<AppMetadata>>,
}

impl CatalogJoin {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        metadata: Arc<dyn MetadataProvider>,
        source_tag: impl Into<String>,
        keying: VersionKeying,
    ) -> Self {
        Self {
            catalog,
            metadata,
            source_tag: source_tag.into(),
            keying,
        }
    }

    pub fn from_config(
        catalog: Arc<dyn CatalogStore>,
        metadata: Arc<dyn MetadataProvider>,
        events: &EventsConfig,
        config: &CatalogConfig,
    ) -> Self {
        Self::new(catalog, metadata, events.catalog_source_tag.clone(), config.version_keying)
    }

    pub fn provider_name(&self) -> &'static str {
        self.metadata.name()
    }

    /// Whether `event` comes from the one catalog-backed service.
    pub fn is_catalog_backed(&self, event: &RawEvent) -> bool {
        event.source_tag.trim().eq_ignore_ascii_case(&self.source_tag)
    }

    /// Enrich a page, preserving its order.
    pub async fn enrich(&self, events: Vec<RawEvent>) -> StoreResult<Vec<EnrichedEvent>> {
        let mut cache = JoinCache::default();
        let mut out = Vec::with_capacity(events.len());
        let mut joined = 0usize;

        for event in events {
            let enriched = self.enrich_one(event, &mut cache).await?;
            if enriched.catalog.is_some() {
                joined += 1;
            }
            out.push(enriched);
        }

        trace!(target: "cachescope::catalog", events = out.len(), joined, "Page enriched");
        Ok(out)
    }

    async fn enrich_one(&self, event: RawEvent, cache: &mut JoinCache) -> StoreResult<EnrichedEvent> {
        let depot = match event.download_key {
            Some(key) if self.is_catalog_backed(&event) => key,
            _ => return Ok(EnrichedEvent::passthrough(event)),
        };

        let parent = self.parent_of(depot, cache).await?;
        let version_key = match self.keying {
            VersionKeying::Parent => parent,
            VersionKeying::Depot => Some(depot),
        };

        let total_bytes = match version_key {
            Some(key) => self
                .latest_version(key, cache)
                .await?
                .map(|v| v.total_bytes())
                .unwrap_or(0),
            None => 0,
        };

        let catalog = match parent {
            Some(parent_key) => Some(CatalogInfo {
                depot_key: depot,
                parent_key,
                metadata: self.metadata_for(parent_key, cache).await,
            }),
            None => None,
        };

        let mut enriched = EnrichedEvent::passthrough(event);
        enriched.total_bytes = total_bytes;
        enriched.catalog = catalog;
        Ok(enriched)
    }

    /// Smallest parent when a depot is shared between titles.
    async fn parent_of(&self, depot: u32, cache: &mut JoinCache) -> StoreResult<Option<u32>> {
        if let Some(hit) = cache.parents.get(&depot) {
            return Ok(*hit);
        }
        let parent = self.catalog.parents_of(depot).await?.into_iter().min();
        cache.parents.insert(depot, parent);
        Ok(parent)
    }

    async fn latest_version(
        &self,
        key: u32,
        cache: &mut JoinCache,
    ) -> StoreResult<Option<CatalogVersion>> {
        if let Some(hit) = cache.versions.get(&key) {
            return Ok(hit.clone());
        }
        let version = self.catalog.latest_version(key).await?;
        cache.versions.insert(key, version.clone());
        Ok(version)
    }

    async fn metadata_for(&self, parent: u32, cache: &mut JoinCache) -> Option<AppMetadata> {
        if let Some(hit) = cache.metadata.get(&parent) {
            return hit.clone();
        }
        let found = self.metadata.metadata(parent).await;
        cache.metadata.insert(parent, found.clone());
        found
    }

    /// Distinct titles with traffic among catalog-backed events, by name.
    pub async fn titles(&self, events: &[RawEvent]) -> StoreResult<Vec<AppMetadata>> {
        let mut cache = JoinCache::default();
        let mut parents = BTreeSet::new();

        for event in events.iter().filter(|e| e.has_traffic() && self.is_catalog_backed(e)) {
            if let Some(depot) = event.download_key {
                if let Some(parent) = self.parent_of(depot, &mut cache).await? {
                    parents.insert(parent);
                }
            }
        }

        let mut titles = Vec::with_capacity(parents.len());
        for parent in parents {
            if let Some(meta) = self.metadata_for(parent, &mut cache).await {
                titles.push(meta);
            }
        }
        titles.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.key.cmp(&b.key)));
        Ok(titles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{at, event};
    use crate::model::CatalogEntry;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn version(key: u32, secs: i64, compressed: u64, extra: u64, token: &str) -> CatalogVersion {
        CatalogVersion {
            key,
            created_at: at(secs),
            compressed_size: compressed,
            uncompressed_size: compressed * 2,
            extra_bytes: extra,
            token: token.into(),
        }
    }

    fn steam_event(id: u64, depot: u32) -> RawEvent {
        let mut e = event(id, "10.0.0.1", 10, 0);
        e.download_key = Some(depot);
        e
    }

    async fn seeded(keying: VersionKeying) -> (Arc<MemoryStore>, CatalogJoin) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_entry(CatalogEntry { depot_key: 731, parent_key: 730 }).await.unwrap();
        store.append_version(version(730, 10, 1_000, 10, "a")).await.unwrap();
        store.append_version(version(730, 20, 5_000, 50, "b")).await.unwrap();
        store.append_version(version(731, 15, 700, 7, "c")).await.unwrap();

        let mirror = MirrorMetadataProvider::new(vec![AppMetadata {
            key: 730,
            name: "Counter-Strike 2".into(),
            header_image: None,
        }]);
        let join = CatalogJoin::new(store.clone(), Arc::new(mirror), "steam", keying);
        (store, join)
    }

    #[tokio::test]
    async fn test_latest_version_sizes_event() {
        let (_, join) = seeded(VersionKeying::Parent).await;
        let page = join.enrich(vec![steam_event(1, 731)]).await.unwrap();

        assert_eq!(page[0].total_bytes, 5_050);
        let info = page[0].catalog.as_ref().unwrap();
        assert_eq!((info.depot_key, info.parent_key), (731, 730));
        assert_eq!(info.metadata.as_ref().map(|m| m.name.as_str()), Some("Counter-Strike 2"));
    }

    #[tokio::test]
    async fn test_depot_keying() {
        let (_, join) = seeded(VersionKeying::Depot).await;
        let page = join.enrich(vec![steam_event(1, 731)]).await.unwrap();
        assert_eq!(page[0].total_bytes, 707);
    }

    #[tokio::test]
    async fn test_unknown_depot_and_other_services_pass_through() {
        let (_, join) = seeded(VersionKeying::Parent).await;
        let mut epic = steam_event(2, 731);
        epic.source_tag = "epicgames".into();

        let page = join.enrich(vec![steam_event(1, 999), epic]).await.unwrap();
        for enriched in &page {
            assert_eq!(enriched.total_bytes, 0);
            assert!(enriched.catalog.is_none());
        }
        assert_eq!(page[1].service_name, "Epic Games");
    }

    #[tokio::test]
    async fn test_entry_without_metadata_still_sized() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_entry(CatalogEntry { depot_key: 1, parent_key: 2 }).await.unwrap();
        store.append_version(version(2, 10, 100, 0, "m-1")).await.unwrap();
        store.append_version(version(2, 11, 300, 0, "m-2")).await.unwrap();

        let join = CatalogJoin::new(
            store,
            Arc::new(MirrorMetadataProvider::default()),
            "steam",
            VersionKeying::Parent,
        );
        let page = join.enrich(vec![steam_event(1, 1)]).await.unwrap();

        assert_eq!(page[0].total_bytes, 300);
        let info = page[0].catalog.as_ref().unwrap();
        assert_eq!(info.parent_key, 2);
        assert_eq!(info.metadata, None);
    }

    #[tokio::test]
    async fn test_enrich_is_idempotent() {
        let (_, join) = seeded(VersionKeying::Parent).await;
        let page = vec![steam_event(1, 731), steam_event(2, 999)];

        let first = join.enrich(page.clone()).await.unwrap();
        let second = join.enrich(page).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_smallest_parent_wins() {
        let (store, join) = seeded(VersionKeying::Parent).await;
        store.upsert_entry(CatalogEntry { depot_key: 731, parent_key: 900 }).await.unwrap();
        store.upsert_entry(CatalogEntry { depot_key: 731, parent_key: 100 }).await.unwrap();

        let page = join.enrich(vec![steam_event(1, 731)]).await.unwrap();
        assert_eq!(page[0].catalog.as_ref().map(|c| c.parent_key), Some(100));
    }

    #[tokio::test]
    async fn test_titles() {
        let (store, join) = seeded(VersionKeying::Parent).await;
        store.upsert_entry(CatalogEntry { depot_key: 441, parent_key: 440 }).await.unwrap();

        let mut idle = steam_event(3, 731);
        idle.hit_bytes = 0;
        let titles = join
            .titles(&[steam_event(1, 731), steam_event(2, 731), steam_event(4, 441), idle])
            .await
            .unwrap();

        // 440 has no metadata in the mirror and is dropped
        assert_eq!(titles.iter().map(|t| t.key).collect::<Vec<_>>(), vec![730]);
    }
}
