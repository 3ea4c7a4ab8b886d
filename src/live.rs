//! A single consumer's live view of recent enriched events.
//!
//! Bootstraps with a full page, then folds a small recent slice in on every
//! refresh signal. A periodic full re-sync covers missed signals and a
//! closed channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accessor::{EventAccessor, EventQuery};
use crate::catalog::CatalogJoin;
use crate::config::{EventsConfig, NotifyConfig};
use crate::error::CacheScopeResult;
use crate::merge::{MergeOutcome, OrderKey, WorkingSet};
use crate::model::EnrichedEvent;
use crate::notify::RefreshReceiver;

/// Where a live view pulls its pages from.
#[async_trait]
pub trait DeltaSource: Send + Sync {
    /// The newest `limit` enriched events, newest first.
    async fn fetch(&self, limit: usize) -> CacheScopeResult<Vec<EnrichedEvent>>;
}

/// Accessor plus catalog join, run in-process.
pub struct LocalFeed {
    accessor: Arc<EventAccessor>,
    join: Arc<CatalogJoin>,
    query: EventQuery,
}

impl LocalFeed {
    pub fn new(accessor: Arc<EventAccessor>, join: Arc<CatalogJoin>, query: EventQuery) -> Self {
        Self { accessor, join, query }
    }
}

#[async_trait]
impl DeltaSource for LocalFeed {
    async fn fetch(&self, limit: usize) -> CacheScopeResult<Vec<EnrichedEvent>> {
        let query = self.query.limit(limit.max(1) as i64);
        let events = self.accessor.recent(&query).await?;
        Ok(self.join.enrich(events).await?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LiveViewSettings {
    pub working_set_cap: usize,
    pub delta_limit: usize,
    pub debounce: Duration,
    pub fallback_poll: Duration,
}

impl LiveViewSettings {
    pub fn from_config(events: &EventsConfig, notify: &NotifyConfig) -> Self {
        Self {
            working_set_cap: events.working_set_cap,
            delta_limit: events.delta_limit,
            debounce: Duration::from_millis(notify.debounce_ms),
            fallback_poll: Duration::from_secs(notify.fallback_poll_secs),
        }
    }
}

pub struct LiveView {
    source: Arc<dyn DeltaSource>,
    working: WorkingSet,
    settings: LiveViewSettings,
}

impl LiveView {
    pub fn new(
        source: Arc<dyn DeltaSource>,
        settings: LiveViewSettings,
        order_key: OrderKey,
    ) -> Self {
        Self {
            source,
            working: WorkingSet::new(settings.working_set_cap, order_key),
            settings,
        }
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working
    }

    /// Replace the working set with a full page.
    pub async fn bootstrap(&mut self) -> CacheScopeResult<MergeOutcome> {
        let page = self.source.fetch(self.settings.working_set_cap).await?;
        Ok(self.working.reset(page))
    }

    /// Fold the newest small slice into the working set.
    pub async fn refresh(&mut self) -> CacheScopeResult<MergeOutcome> {
        let delta = self.source.fetch(self.settings.delta_limit).await?;
        Ok(self.working.merge(delta))
    }

    /// Fold a full page in without dropping what is already held.
    pub async fn resync(&mut self) -> CacheScopeResult<MergeOutcome> {
        let page = self.source.fetch(self.settings.working_set_cap).await?;
        Ok(self.working.merge(page))
    }

    /// Drive the view until `cancel` fires, calling `on_update` whenever the
    /// working set may have changed.
    pub async fn run<F>(mut self, signals: RefreshReceiver, cancel: CancellationToken, mut on_update: F)
    where
        F: FnMut(&WorkingSet, MergeOutcome) + Send,
    {
        match self.bootstrap().await {
            Ok(outcome) => on_update(&self.working, outcome),
            Err(e) => warn!(target: "cachescope::live", error = %e, "Bootstrap failed, waiting for next refresh"),
        }

        let mut signals = Some(signals);
        let mut fallback = interval(self.settings.fallback_poll);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);
        fallback.tick().await;

        loop {
            let debounce = self.settings.debounce;
            let next_signal = async {
                match signals.as_mut() {
                    Some(rx) => rx.recv_debounced(debounce).await,
                    None => std::future::pending().await,
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = next_signal => match signal {
                    Some(_) => self.refresh().await,
                    None => {
                        debug!(target: "cachescope::live", "Refresh channel closed, polling only");
                        signals = None;
                        continue;
                    }
                },
                _ = fallback.tick() => self.resync().await,
            };

            match result {
                Ok(outcome) if outcome.changed() => on_update(&self.working, outcome),
                Ok(_) => {}
                Err(e) => warn!(target: "cachescope::live", error = %e, "Live view fetch failed"),
            }
        }
    }
}
