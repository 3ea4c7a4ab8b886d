//! Core data model: raw cache events, catalog rows, rate samples and the
//! enriched event shape handed to consumers.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Stable, store-assigned event identity
pub type EventId = u64;

// ----------------------------------------------------------------------------
// Raw Events
// ----------------------------------------------------------------------------

/// A download record produced by the caching proxy's ingester.
///
/// Rows are mutated in place as more bytes are observed; `last_updated_at`
/// and the byte counters only ever move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: EventId,
    /// Upstream service the download came from (`steam`, `epicgames`, ...)
    pub source_tag: String,
    /// Numeric catalog key, when the service has one
    #[serde(default)]
    pub download_key: Option<u32>,
    /// Free-form identifier for services without numeric keys
    #[serde(default)]
    pub download_key_str: Option<String>,
    pub client_address: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub hit_bytes: u64,
    pub miss_bytes: u64,
}

impl RawEvent {
    /// Bytes observed so far, served from cache or fetched upstream.
    #[inline]
    pub fn observed_bytes(&self) -> u64 {
        self.hit_bytes.saturating_add(self.miss_bytes)
    }

    /// Whether any byte has been attributed to this event yet.
    #[inline]
    pub fn has_traffic(&self) -> bool {
        self.hit_bytes != 0 || self.miss_bytes != 0
    }

    pub fn check_invariants(&self) -> StoreResult<()> {
        if self.last_updated_at < self.created_at {
            return Err(StoreError::invalid(
                "event",
                format!("event {} updated before it was created", self.id),
            ));
        }
        if self.client_address.trim().is_empty() {
            return Err(StoreError::invalid(
                "event",
                format!("event {} has no client address", self.id),
            ));
        }
        Ok(())
    }

    /// Check that `next` is a legal in-place update of `self`.
    pub fn check_update(&self, next: &RawEvent) -> StoreResult<()> {
        next.check_invariants()?;
        if next.created_at != self.created_at {
            return Err(StoreError::invalid(
                "event",
                format!("event {} creation time cannot change", self.id),
            ));
        }
        if next.last_updated_at < self.last_updated_at {
            return Err(StoreError::invalid(
                "event",
                format!("event {} last update moved backwards", self.id),
            ));
        }
        if next.observed_bytes() < self.observed_bytes() {
            return Err(StoreError::invalid(
                "event",
                format!("event {} byte counters regressed", self.id),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

/// Maps a fine-grained download key (depot) onto its parent title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub depot_key: u32,
    pub parent_key: u32,
}

/// One published version of a catalog item, append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogVersion {
    /// Parent key or depot key, depending on how versions are filed
    pub key: u32,
    pub created_at: DateTime<Utc>,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Manifest overhead on top of the compressed payload
    pub extra_bytes: u64,
    /// Globally unique across all versions
    pub token: String,
}

impl CatalogVersion {
    /// Bytes a client has to pull for this version.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.compressed_size.saturating_add(self.extra_bytes)
    }
}

/// Human-facing metadata about a parent title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    pub key: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_image: Option<String>,
}

/// Catalog context attached to an enriched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogInfo {
    pub depot_key: u32,
    pub parent_key: u32,
    #[serde(default)]
    pub metadata: Option<AppMetadata>,
}

/// A raw event plus the fields the catalog join computes for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub event: RawEvent,
    pub total_bytes: u64,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogInfo>,
}

impl EnrichedEvent {
    /// Wrap an event that has nothing to join against.
    pub fn passthrough(event: RawEvent) -> Self {
        let service_name = service_display_name(&event.source_tag).into_owned();
        Self {
            event,
            total_bytes: 0,
            service_name,
            catalog: None,
        }
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.event.id
    }
}

// ----------------------------------------------------------------------------
// Exclusions & Settings
// ----------------------------------------------------------------------------

/// A client address hidden from aggregate views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionEntry {
    pub address: String,
    pub added_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// Rate Samples
// ----------------------------------------------------------------------------

/// Instantaneous throughput of one interface at one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSample {
    pub interface: CompactString,
    pub timestamp: DateTime<Utc>,
    pub sent_bytes_per_sec: u64,
    pub received_bytes_per_sec: u64,
}

// ----------------------------------------------------------------------------
// Service Names
// ----------------------------------------------------------------------------

const SERVICE_DISPLAY_NAMES: &[(&str, &str)] = &[
    ("steam", "Steam"),
    ("epicgames", "Epic Games"),
    ("blizzard", "Battle.net"),
    ("wsus", "Windows Update"),
    ("cod", "Call Of Duty"),
    ("riot", "Riot Games"),
    ("xboxlive", "Xbox Live"),
    ("uplay", "Uplay"),
];

/// Display name for a source tag; unknown tags pass through unchanged.
pub fn service_display_name(tag: &str) -> Cow<'_, str> {
    let trimmed = tag.trim();
    SERVICE_DISPLAY_NAMES
        .iter()
        .find(|(raw, _)| raw.eq_ignore_ascii_case(trimmed))
        .map(|(_, display)| Cow::Borrowed(*display))
        .unwrap_or(Cow::Borrowed(trimmed))
}
