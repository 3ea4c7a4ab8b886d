//! Filtered read access over the raw event log.
//!
//! Every query reads the exclusion list fresh from the store, so adding or
//! removing an address takes effect on the very next call.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::EventsConfig;
use crate::error::StoreResult;
use crate::merge::OrderKey;
use crate::model::{service_display_name, RawEvent};
use crate::store::{EventFilter, EventStore, ExclusionStore};

// ----------------------------------------------------------------------------
// Query Input
// ----------------------------------------------------------------------------

/// Caller-facing filter. Out-of-range values are normalized, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    /// Look back this many days; 0 or negative means no bound
    #[serde(default)]
    pub days: i64,
    /// Hide addresses on the exclusion list; on unless asked otherwise
    #[serde(default = "default_true", rename = "excludeIPs")]
    pub exclude_addresses: bool,
    /// Result cap; 0 or negative means the configured default
    #[serde(default)]
    pub limit: i64,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            days: 0,
            exclude_addresses: true,
            limit: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn days(mut self, days: i64) -> Self {
        self.days = days;
        self
    }

    pub fn excluding_addresses(mut self, exclude: bool) -> Self {
        self.exclude_addresses = exclude;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Lower bound on `last_updated_at`, if any.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.days <= 0 {
            return None;
        }
        ChronoDuration::try_days(self.days).and_then(|d| now.checked_sub_signed(d))
    }

    pub fn effective_limit(&self, default: usize) -> usize {
        if self.limit <= 0 {
            default
        } else {
            usize::try_from(self.limit).unwrap_or(usize::MAX)
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregate Shapes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitMissTotals {
    pub hit_bytes: u64,
    pub miss_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTotals {
    pub address: String,
    pub hit_bytes: u64,
    pub miss_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientBytes {
    pub address: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTotals {
    pub source_tag: String,
    pub service_name: String,
    pub total_bytes: u64,
}

/// Source tags that are really client or upstream addresses
fn looks_like_address(tag: &str) -> bool {
    tag.parse::<IpAddr>().is_ok() || tag.parse::<SocketAddr>().is_ok()
}

// ----------------------------------------------------------------------------
// Accessor
// ----------------------------------------------------------------------------

pub struct EventAccessor {
    events: Arc<dyn EventStore>,
    exclusions: Arc<dyn ExclusionStore>,
    default_limit: usize,
    require_traffic: bool,
    order_key: OrderKey,
}

impl EventAccessor {
    pub fn new(
        events: Arc<dyn EventStore>,
        exclusions: Arc<dyn ExclusionStore>,
        config: &EventsConfig,
    ) -> Self {
        Self {
            events,
            exclusions,
            default_limit: config.default_limit,
            require_traffic: config.require_traffic,
            order_key: config.order_key,
        }
    }

    pub fn order_key(&self) -> OrderKey {
        self.order_key
    }

    async fn filter_for(&self, query: &EventQuery, require_traffic: bool) -> StoreResult<EventFilter> {
        let excluded: HashSet<String> = if query.exclude_addresses {
            self.exclusions
                .exclusions()
                .await?
                .into_iter()
                .map(|e| e.address)
                .collect()
        } else {
            HashSet::new()
        };

        Ok(EventFilter {
            since: query.since(Utc::now()),
            excluded,
            require_traffic,
        })
    }

    /// Events matching `query` and `extra`, newest first, capped.
    pub async fn query<F>(&self, query: &EventQuery, extra: F) -> StoreResult<Vec<RawEvent>>
    where
        F: Fn(&RawEvent) -> bool + Send + Sync,
    {
        let filter = self.filter_for(query, false).await?;
        let mut events: Vec<RawEvent> = self
            .events
            .scan_events(&filter)
            .await?
            .into_iter()
            .filter(|e| extra(e))
            .collect();

        let key = self.order_key;
        events.sort_by(|a, b| key.compare(a, b));
        events.truncate(query.effective_limit(self.default_limit));
        Ok(events)
    }

    /// The "recent downloads" page.
    pub async fn recent(&self, query: &EventQuery) -> StoreResult<Vec<RawEvent>> {
        let require_traffic = self.require_traffic;
        let events = self
            .query(query, move |e| !require_traffic || e.has_traffic())
            .await?;
        trace!(target: "cachescope::accessor", count = events.len(), days = query.days, "Recent events");
        Ok(events)
    }

    /// Uncapped scan for aggregates; same window, exclusion and traffic rules.
    async fn scan(&self, query: &EventQuery) -> StoreResult<Vec<RawEvent>> {
        let filter = self.filter_for(query, self.require_traffic).await?;
        self.events.scan_events(&filter).await
    }

    pub async fn hit_miss_totals(&self, query: &EventQuery) -> StoreResult<HitMissTotals> {
        Ok(self
            .scan(query)
            .await?
            .iter()
            .fold(HitMissTotals::default(), |acc, e| HitMissTotals {
                hit_bytes: acc.hit_bytes.saturating_add(e.hit_bytes),
                miss_bytes: acc.miss_bytes.saturating_add(e.miss_bytes),
            }))
    }

    /// Per-client hit/miss, busiest first.
    pub async fn client_totals(&self, query: &EventQuery) -> StoreResult<Vec<ClientTotals>> {
        let mut by_client: HashMap<String, (u64, u64)> = HashMap::new();
        for e in self.scan(query).await? {
            let slot = by_client.entry(e.client_address.trim().to_string()).or_default();
            slot.0 = slot.0.saturating_add(e.hit_bytes);
            slot.1 = slot.1.saturating_add(e.miss_bytes);
        }

        let mut totals: Vec<ClientTotals> = by_client
            .into_iter()
            .map(|(address, (hit_bytes, miss_bytes))| ClientTotals {
                address,
                hit_bytes,
                miss_bytes,
            })
            .collect();
        totals.sort_by(|a, b| {
            (b.hit_bytes.saturating_add(b.miss_bytes))
                .cmp(&a.hit_bytes.saturating_add(a.miss_bytes))
                .then_with(|| a.address.cmp(&b.address))
        });
        Ok(totals)
    }

    pub async fn client_hits(&self, query: &EventQuery) -> StoreResult<Vec<ClientBytes>> {
        self.client_single(query, |t| t.hit_bytes).await
    }

    pub async fn client_misses(&self, query: &EventQuery) -> StoreResult<Vec<ClientBytes>> {
        self.client_single(query, |t| t.miss_bytes).await
    }

    async fn client_single(
        &self,
        query: &EventQuery,
        pick: fn(&ClientTotals) -> u64,
    ) -> StoreResult<Vec<ClientBytes>> {
        let mut out: Vec<ClientBytes> = self
            .client_totals(query)
            .await?
            .iter()
            .map(|t| ClientBytes {
                address: t.address.clone(),
                bytes: pick(t),
            })
            .collect();
        out.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.address.cmp(&b.address)));
        Ok(out)
    }

    /// Bytes per upstream service, largest first.
    pub async fn service_totals(&self, query: &EventQuery) -> StoreResult<Vec<ServiceTotals>> {
        let mut by_tag: HashMap<String, u64> = HashMap::new();
        for e in self.scan(query).await? {
            let tag = e.source_tag.trim();
            if tag.is_empty() || looks_like_address(tag) {
                continue;
            }
            let slot = by_tag.entry(tag.to_string()).or_default();
            *slot = slot.saturating_add(e.observed_bytes());
        }

        let mut totals: Vec<ServiceTotals> = by_tag
            .into_iter()
            .filter(|(_, total)| *total > 0)
            .map(|(tag, total_bytes)| ServiceTotals {
                service_name: service_display_name(&tag).into_owned(),
                source_tag: tag,
                total_bytes,
            })
            .collect();
        totals.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then_with(|| a.source_tag.cmp(&b.source_tag))
        });
        Ok(totals)
    }
}
