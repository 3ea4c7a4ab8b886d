//! Read side of the rate series.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use compact_str::CompactString;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::model::RateSample;
use crate::store::{RateSeriesStore, SettingsStore};

pub const DEFAULT_RECENT_MINUTES: i64 = 5;

/// Settings key holding the interface the dashboard graphs by default.
pub const GRAPH_INTERFACE_SETTING: &str = "network_graph_interface";

/// Query facade over the sampler's output.
#[derive(Clone)]
pub struct RateSeries {
    store: Arc<dyn RateSeriesStore>,
    settings: Arc<dyn SettingsStore>,
}

impl RateSeries {
    pub fn new(store: Arc<dyn RateSeriesStore>, settings: Arc<dyn SettingsStore>) -> Self {
        Self { store, settings }
    }

    pub async fn series(
        &self,
        interface: &str,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> StoreResult<Vec<RateSample>> {
        self.store.series(interface, from, to).await
    }

    /// The last `minutes` of samples, oldest first. Non-positive means the
    /// default window.
    pub async fn recent(&self, interface: &str, minutes: i64) -> StoreResult<Vec<RateSample>> {
        let minutes = if minutes > 0 { minutes } else { DEFAULT_RECENT_MINUTES };
        let now = Utc::now();
        self.store
            .series(interface, now - ChronoDuration::minutes(minutes), now)
            .await
    }

    pub async fn interfaces(&self) -> StoreResult<Vec<CompactString>> {
        self.store.interfaces().await
    }

    pub async fn latest(&self, interface: &str) -> StoreResult<Option<RateSample>> {
        self.store.latest(interface).await
    }

    pub async fn preferred_interface(&self) -> StoreResult<Option<String>> {
        self.settings.get_setting(GRAPH_INTERFACE_SETTING).await
    }

    pub async fn set_preferred_interface(&self, interface: &str) -> StoreResult<()> {
        let interface = interface.trim();
        if interface.is_empty() {
            return Err(StoreError::invalid("setting", "interface name is required"));
        }
        self.settings
            .put_setting(GRAPH_INTERFACE_SETTING, interface)
            .await?;
        info!(target: "cachescope::sampler", interface, "Graph interface updated");
        Ok(())
    }
}
