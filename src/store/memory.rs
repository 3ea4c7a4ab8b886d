//! In-memory backend for every storage trait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    CatalogStore, EventFilter, EventStore, ExclusionStore, RateSeriesStore, SettingsStore,
};
use crate::error::{StoreError, StoreResult};
use crate::model::{CatalogEntry, CatalogVersion, EventId, ExclusionEntry, RateSample, RawEvent};

/// Versions are ordered by creation time, then token, so the last entry is
/// always the one enrichment should use.
type VersionSlot = (DateTime<Utc>, String);

#[derive(Default)]
struct VersionIndex {
    by_key: HashMap<u32, BTreeMap<VersionSlot, CatalogVersion>>,
    /// token -> (key, created_at), enforces global token uniqueness
    tokens: HashMap<String, (u32, DateTime<Utc>)>,
}

/// Process-local store. Cheap to construct; share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    rates: RwLock<Vec<RateSample>>,
    events: RwLock<BTreeMap<EventId, RawEvent>>,
    revision: AtomicU64,
    entries: RwLock<BTreeSet<CatalogEntry>>,
    versions: RwLock<VersionIndex>,
    exclusions: DashMap<String, ExclusionEntry>,
    settings: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rate samples across all interfaces.
    pub fn sample_count(&self) -> usize {
        self.rates.read().len()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }
}

#[async_trait]
impl RateSeriesStore for MemoryStore {
    async fn append_and_prune(
        &self,
        samples: Vec<RateSample>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut rates = self.rates.write();
        let before = rates.len();
        rates.retain(|s| s.timestamp >= cutoff);
        let pruned = before - rates.len();
        rates.extend(samples.into_iter().filter(|s| s.timestamp >= cutoff));
        Ok(pruned)
    }

    async fn series(
        &self,
        interface: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RateSample>> {
        let mut out: Vec<RateSample> = self
            .rates
            .read()
            .iter()
            .filter(|s| s.interface == interface && s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    async fn interfaces(&self) -> StoreResult<Vec<CompactString>> {
        let mut newest: HashMap<CompactString, DateTime<Utc>> = HashMap::new();
        for sample in self.rates.read().iter() {
            newest
                .entry(sample.interface.clone())
                .and_modify(|t| *t = (*t).max(sample.timestamp))
                .or_insert(sample.timestamp);
        }
        let mut names: Vec<_> = newest.into_iter().collect();
        names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(names.into_iter().map(|(name, _)| name).collect())
    }

    async fn latest(&self, interface: &str) -> StoreResult<Option<RateSample>> {
        Ok(self
            .rates
            .read()
            .iter()
            .filter(|s| s.interface == interface)
            .max_by_key(|s| s.timestamp)
            .cloned())
    }

    async fn oldest_sample_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.rates.read().iter().map(|s| s.timestamp).min())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_event(&self, event: RawEvent) -> StoreResult<()> {
        event.check_invariants()?;
        let mut events = self.events.write();
        if let Some(existing) = events.get(&event.id) {
            existing.check_update(&event)?;
        }
        events.insert(event.id, event);
        self.revision.fetch_add(1, AtomicOrdering::Release);
        Ok(())
    }

    async fn scan_events(&self, filter: &EventFilter) -> StoreResult<Vec<RawEvent>> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn revision(&self) -> StoreResult<u64> {
        Ok(self.revision.load(AtomicOrdering::Acquire))
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert_entry(&self, entry: CatalogEntry) -> StoreResult<()> {
        self.entries.write().insert(entry);
        Ok(())
    }

    async fn append_version(&self, version: CatalogVersion) -> StoreResult<()> {
        if version.token.trim().is_empty() {
            return Err(StoreError::invalid("catalog version", "empty version token"));
        }

        let mut guard = self.versions.write();
        let index = &mut *guard;
        let slot = (version.created_at, version.token.clone());

        if let Some(&(key, created_at)) = index.tokens.get(&version.token) {
            let same_row = index
                .by_key
                .get(&key)
                .and_then(|history| history.get(&(created_at, version.token.clone())))
                .map(|existing| *existing == version)
                .unwrap_or(false);
            return if same_row {
                Ok(())
            } else {
                Err(StoreError::conflict("catalog version token", version.token))
            };
        }

        let history = index.by_key.entry(version.key).or_default();
        if history.keys().any(|(t, _)| *t == version.created_at) {
            return Err(StoreError::conflict(
                "catalog version",
                format!("{}@{}", version.key, version.created_at.to_rfc3339()),
            ));
        }
        let key = version.key;
        let created_at = version.created_at;
        history.insert(slot, version.clone());
        index.tokens.insert(version.token, (key, created_at));
        Ok(())
    }

    async fn parents_of(&self, depot_key: u32) -> StoreResult<Vec<u32>> {
        let lower = CatalogEntry { depot_key, parent_key: 0 };
        let upper = CatalogEntry { depot_key, parent_key: u32::MAX };
        Ok(self
            .entries
            .read()
            .range(lower..=upper)
            .map(|e| e.parent_key)
            .collect())
    }

    async fn latest_version(&self, key: u32) -> StoreResult<Option<CatalogVersion>> {
        Ok(self
            .versions
            .read()
            .by_key
            .get(&key)
            .and_then(|history| history.values().next_back().cloned()))
    }

    async fn versions(&self, key: u32) -> StoreResult<Vec<CatalogVersion>> {
        Ok(self
            .versions
            .read()
            .by_key
            .get(&key)
            .map(|history| history.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExclusionStore for MemoryStore {
    async fn insert_exclusion(&self, address: &str) -> StoreResult<ExclusionEntry> {
        let address = address.trim();
        if address.is_empty() {
            return Err(StoreError::invalid("exclusion", "address is required"));
        }
        match self.exclusions.entry(address.to_string()) {
            Entry::Occupied(_) => Err(StoreError::conflict("exclusion", address)),
            Entry::Vacant(slot) => {
                let entry = ExclusionEntry {
                    address: address.to_string(),
                    added_at: Utc::now(),
                };
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    async fn delete_exclusion(&self, address: &str) -> StoreResult<()> {
        let address = address.trim();
        if address.is_empty() {
            return Err(StoreError::invalid("exclusion", "address is required"));
        }
        self.exclusions
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("exclusion", address))
    }

    async fn exclusions(&self) -> StoreResult<Vec<ExclusionEntry>> {
        let mut entries: Vec<ExclusionEntry> =
            self.exclusions.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(entries)
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.settings.get(key).map(|v| v.value().clone()))
    }

    async fn put_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{at, event};
    use pretty_assertions::assert_eq;

    fn sample(interface: &str, secs: i64, sent: u64) -> RateSample {
        RateSample {
            interface: interface.into(),
            timestamp: at(secs),
            sent_bytes_per_sec: sent,
            received_bytes_per_sec: sent * 2,
        }
    }

    fn version(key: u32, secs: i64, size: u64, token: &str) -> CatalogVersion {
        CatalogVersion {
            key,
            created_at: at(secs),
            compressed_size: size,
            uncompressed_size: size * 2,
            extra_bytes: 10,
            token: token.into(),
        }
    }

    #[tokio::test]
    async fn test_append_and_prune_is_time_bounded() {
        let store = MemoryStore::new();
        store
            .append_and_prune(vec![sample("eth0", 0, 1), sample("eth0", 10, 2)], at(-100))
            .await
            .unwrap();

        let pruned = store
            .append_and_prune(vec![sample("eth0", 20, 3)], at(5))
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        assert_eq!(store.sample_count(), 2);
        assert_eq!(store.oldest_sample_at().await.unwrap(), Some(at(10)));
    }

    #[tokio::test]
    async fn test_interfaces_most_recent_first() {
        let store = MemoryStore::new();
        store
            .append_and_prune(
                vec![sample("eth0", 1, 1), sample("wlan0", 5, 1), sample("eth0", 3, 1)],
                at(-100),
            )
            .await
            .unwrap();

        let names = store.interfaces().await.unwrap();
        assert_eq!(names, vec![CompactString::from("wlan0"), CompactString::from("eth0")]);

        let latest = store.latest("eth0").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, at(3));

        let series = store.series("eth0", at(0), at(2)).await.unwrap();
        assert_eq!(series.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_event_bumps_revision_and_rejects_regression() {
        let store = MemoryStore::new();
        store.upsert_event(event(1, "10.0.0.1", 100, 0)).await.unwrap();
        assert_eq!(store.revision().await.unwrap(), 1);

        let mut grown = event(1, "10.0.0.1", 200, 0);
        grown.last_updated_at = at(5);
        store.upsert_event(grown).await.unwrap();
        assert_eq!(store.revision().await.unwrap(), 2);
        assert_eq!(store.event_count(), 1);

        let err = store.upsert_event(event(1, "10.0.0.1", 50, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput { .. }));
        assert_eq!(store.revision().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_exclusion_conflict_and_not_found() {
        let store = MemoryStore::new();
        store.insert_exclusion(" 10.0.0.5 ").await.unwrap();

        let dup = store.insert_exclusion("10.0.0.5").await.unwrap_err();
        assert!(matches!(dup, StoreError::Conflict { .. }));

        store.delete_exclusion("10.0.0.5").await.unwrap();
        let missing = store.delete_exclusion("10.0.0.5").await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound { .. }));

        let blank = store.insert_exclusion("   ").await.unwrap_err();
        assert!(matches!(blank, StoreError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_catalog_entries_are_idempotent() {
        let store = MemoryStore::new();
        let entry = CatalogEntry { depot_key: 731, parent_key: 730 };
        store.upsert_entry(entry).await.unwrap();
        store.upsert_entry(entry).await.unwrap();
        store.upsert_entry(CatalogEntry { depot_key: 732, parent_key: 730 }).await.unwrap();

        assert_eq!(store.parents_of(731).await.unwrap(), vec![730]);
        assert!(store.parents_of(999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_version_wins_and_history_kept() {
        let store = MemoryStore::new();
        store.append_version(version(730, 100, 5_000, "m-2")).await.unwrap();
        store.append_version(version(730, 50, 1_000, "m-1")).await.unwrap();

        let latest = store.latest_version(730).await.unwrap().unwrap();
        assert_eq!(latest.token, "m-2");
        assert_eq!(store.versions(730).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_version_token_uniqueness() {
        let store = MemoryStore::new();
        let v = version(730, 100, 5_000, "m-1");
        store.append_version(v.clone()).await.unwrap();
        store.append_version(v).await.unwrap();

        let reused = store.append_version(version(440, 10, 1, "m-1")).await.unwrap_err();
        assert!(matches!(reused, StoreError::Conflict { .. }));

        let same_slot = store.append_version(version(730, 100, 9, "m-9")).await.unwrap_err();
        assert!(matches!(same_slot, StoreError::Conflict { .. }));
    }
}
