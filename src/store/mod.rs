//! Storage seams.
//!
//! Each concern gets its own trait so components only see the slice of the
//! store they use. [`MemoryStore`] implements all of them and is what the
//! engine runs on; any append-only backend can stand in for it.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compact_str::CompactString;

use crate::error::StoreResult;
use crate::model::{CatalogEntry, CatalogVersion, ExclusionEntry, RateSample, RawEvent};

mod memory;

pub use memory::MemoryStore;

// ----------------------------------------------------------------------------
// Rate Series
// ----------------------------------------------------------------------------

/// Row-oriented storage for interface rate samples. Append and batch-delete
/// only; samples are never updated in place.
#[async_trait]
pub trait RateSeriesStore: Send + Sync {
    /// Insert `samples` and delete every sample older than `cutoff` as one
    /// batch. Returns the number of rows pruned.
    async fn append_and_prune(
        &self,
        samples: Vec<RateSample>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Samples for `interface` with `from <= timestamp <= to`, oldest first.
    async fn series(
        &self,
        interface: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<RateSample>>;

    /// Distinct interface names, most recently sampled first.
    async fn interfaces(&self) -> StoreResult<Vec<CompactString>>;

    async fn latest(&self, interface: &str) -> StoreResult<Option<RateSample>>;

    async fn oldest_sample_at(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

// ----------------------------------------------------------------------------
// Raw Events
// ----------------------------------------------------------------------------

/// Predicate pushed down into the event store.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Keep events with `last_updated_at >= since`
    pub since: Option<DateTime<Utc>>,
    /// Drop events from these client addresses
    pub excluded: HashSet<String>,
    /// Drop events that have no hit or miss bytes
    pub require_traffic: bool,
}

impl EventFilter {
    pub fn matches(&self, event: &RawEvent) -> bool {
        if let Some(since) = self.since {
            if event.last_updated_at < since {
                return false;
            }
        }
        if self.require_traffic && !event.has_traffic() {
            return false;
        }
        !self.excluded.contains(event.client_address.trim())
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event or update an existing one in place.
    async fn upsert_event(&self, event: RawEvent) -> StoreResult<()>;

    /// Every event matching `filter`, in no particular order.
    async fn scan_events(&self, filter: &EventFilter) -> StoreResult<Vec<RawEvent>>;

    /// Monotonic counter bumped on every write.
    async fn revision(&self) -> StoreResult<u64>;
}

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Idempotent insert of a depot → parent mapping.
    async fn upsert_entry(&self, entry: CatalogEntry) -> StoreResult<()>;

    /// Append a version. Re-appending an identical row is a no-op; reusing a
    /// token or a `(key, created_at)` slot for different data is a conflict.
    async fn append_version(&self, version: CatalogVersion) -> StoreResult<()>;

    /// Parent keys for a depot, ascending.
    async fn parents_of(&self, depot_key: u32) -> StoreResult<Vec<u32>>;

    /// The version with the greatest `(created_at, token)` for `key`.
    async fn latest_version(&self, key: u32) -> StoreResult<Option<CatalogVersion>>;

    /// Full version history for `key`, oldest first.
    async fn versions(&self, key: u32) -> StoreResult<Vec<CatalogVersion>>;
}

// ----------------------------------------------------------------------------
// Exclusions & Settings
// ----------------------------------------------------------------------------

#[async_trait]
pub trait ExclusionStore: Send + Sync {
    async fn insert_exclusion(&self, address: &str) -> StoreResult<ExclusionEntry>;

    async fn delete_exclusion(&self, address: &str) -> StoreResult<()>;

    async fn exclusions(&self) -> StoreResult<Vec<ExclusionEntry>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Everything the engine needs from one backend.
pub trait TelemetryStore:
    RateSeriesStore + EventStore + CatalogStore + ExclusionStore + SettingsStore
{
}

impl<T> TelemetryStore for T where
    T: RateSeriesStore + EventStore + CatalogStore + ExclusionStore + SettingsStore
{
}
