//! App metadata providers.
//!
//! The join only needs "metadata for parent key K, if known". Which
//! implementation answers is decided once at startup from configuration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{CatalogConfig, CatalogProviderKind};
use crate::error::{CatalogError, CatalogResult};
use crate::model::AppMetadata;

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata for `key`. Lookup problems are logged and reported as `None`.
    async fn metadata(&self, key: u32) -> Option<AppMetadata>;
}

/// Build the provider selected in configuration.
pub fn from_config(config: &CatalogConfig) -> CatalogResult<Arc<dyn MetadataProvider>> {
    match config.provider {
        CatalogProviderKind::Mirror => {
            let mirror = match &config.mirror_path {
                Some(path) => MirrorMetadataProvider::load(path)?,
                None => MirrorMetadataProvider::default(),
            };
            Ok(Arc::new(mirror))
        }
        CatalogProviderKind::Live => {
            let template = config.live_url_template.clone().unwrap_or_default();
            Ok(Arc::new(LiveMetadataProvider::new(
                template,
                Duration::from_secs(config.http_timeout_secs),
            )?))
        }
    }
}

// ----------------------------------------------------------------------------
// Local Mirror
// ----------------------------------------------------------------------------

/// Locally maintained metadata, swapped wholesale on reload.
#[derive(Default)]
pub struct MirrorMetadataProvider {
    entries: ArcSwap<HashMap<u32, AppMetadata>>,
}

impl MirrorMetadataProvider {
    pub fn new(entries: impl IntoIterator<Item = AppMetadata>) -> Self {
        let mirror = Self::default();
        mirror.replace(entries);
        mirror
    }

    /// Load a JSON array of metadata objects.
    pub fn load(path: &Path) -> CatalogResult<Self> {
        let mirror = Self::default();
        mirror.reload(path)?;
        Ok(mirror)
    }

    pub fn reload(&self, path: &Path) -> CatalogResult<usize> {
        let mirror_err = |message: String| CatalogError::MirrorLoad {
            path: path.to_path_buf(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| mirror_err(e.to_string()))?;
        let entries: Vec<AppMetadata> =
            serde_json::from_str(&raw).map_err(|e| mirror_err(e.to_string()))?;

        let count = self.replace(entries);
        info!(target: "cachescope::catalog", path = %path.display(), entries = count, "Metadata mirror loaded");
        Ok(count)
    }

    /// Atomically replace the whole mirror. Returns the new size.
    pub fn replace(&self, entries: impl IntoIterator<Item = AppMetadata>) -> usize {
        let map: HashMap<u32, AppMetadata> = entries.into_iter().map(|m| (m.key, m)).collect();
        let count = map.len();
        self.entries.store(Arc::new(map));
        count
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataProvider for MirrorMetadataProvider {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn metadata(&self, key: u32) -> Option<AppMetadata> {
        self.entries.load().get(&key).cloned()
    }
}

// ----------------------------------------------------------------------------
// Live Lookup
// ----------------------------------------------------------------------------

/// HTTP lookup against a store-style details endpoint, with a result cache.
pub struct LiveMetadataProvider {
    client: reqwest::Client,
    url_template: String,
    /// Positive and negative answers; failures are not cached
    cache: DashMap<u32, Option<AppMetadata>>,
}

impl LiveMetadataProvider {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> CatalogResult<Self> {
        let url_template = url_template.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(concat!("cachescope/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CatalogError::LookupFailed {
                key: 0,
                message: format!("http client: {e}"),
            })?;

        Ok(Self {
            client,
            url_template,
            cache: DashMap::new(),
        })
    }

    pub fn url_for(&self, key: u32) -> String {
        self.url_template.replace("{key}", &key.to_string())
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    async fn fetch(&self, key: u32) -> CatalogResult<Option<AppMetadata>> {
        let url = self.url_for(key);
        let lookup_err = |message: String| CatalogError::LookupFailed { key, message };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| lookup_err(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(lookup_err(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CatalogError::MalformedResponse {
                key,
                message: e.to_string(),
            })?;
        parse_metadata(key, &body)
    }
}

#[async_trait]
impl MetadataProvider for LiveMetadataProvider {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn metadata(&self, key: u32) -> Option<AppMetadata> {
        if let Some(hit) = self.cache.get(&key) {
            return hit.value().clone();
        }

        match self.fetch(key).await {
            Ok(found) => {
                debug!(target: "cachescope::catalog", key, found = found.is_some(), "Live metadata lookup");
                self.cache.insert(key, found.clone());
                found
            }
            Err(e) => {
                warn!(target: "cachescope::catalog", key, error = %e, "Live metadata lookup failed");
                None
            }
        }
    }
}

/// Accepts either a bare metadata object or an envelope keyed by the
/// requested key: `{"<key>": {"success": true, "data": {...}}}`.
pub fn parse_metadata(key: u32, body: &Value) -> CatalogResult<Option<AppMetadata>> {
    let malformed = |message: &str| CatalogError::MalformedResponse {
        key,
        message: message.to_string(),
    };

    let data = match body.get(key.to_string()) {
        Some(envelope) => {
            if !envelope.get("success").and_then(Value::as_bool).unwrap_or(false) {
                return Ok(None);
            }
            envelope.get("data").ok_or_else(|| malformed("envelope without data"))?
        }
        None => body,
    };

    let name = data
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| malformed("missing name"))?;

    let header_image = data
        .get("header_image")
        .or_else(|| data.get("headerImage"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Some(AppMetadata {
        key,
        name: name.to_string(),
        header_image,
    }))
}
