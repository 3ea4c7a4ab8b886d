//! Configuration system.
//!
//! TOML file parsing with `CACHESCOPE_`-prefixed environment overrides
//! (nested keys split on `__`, e.g. `CACHESCOPE_SAMPLER__TICK_INTERVAL_MS=1000`).
//! Every field has a default so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::merge::OrderKey;
use crate::{
    DEFAULT_DELTA_LIMIT, DEFAULT_EVENT_LIMIT, DEFAULT_RETENTION_SECS, DEFAULT_TICK_INTERVAL_MS,
    DEFAULT_WORKING_SET_CAP,
};

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Interface rate sampler
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Event queries and live view sizing
    #[serde(default)]
    pub events: EventsConfig,

    /// Catalog enrichment
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Refresh notification channel
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CACHESCOPE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(&self.sampler)?;
        Validate::validate(&self.events)?;
        Validate::validate(&self.catalog)?;
        Validate::validate(&self.notify)?;

        if self.events.delta_limit > self.events.working_set_cap {
            return Err(ConfigError::invalid_value(
                "events.delta_limit",
                format!(
                    "delta limit {} exceeds working set cap {}",
                    self.events.delta_limit, self.events.working_set_cap
                ),
            ));
        }

        if self.notify.reconnect_min_ms > self.notify.reconnect_max_ms {
            return Err(ConfigError::invalid_value(
                "notify.reconnect_min_ms",
                "must not exceed notify.reconnect_max_ms",
            ));
        }

        if self.catalog.provider == CatalogProviderKind::Live
            && self.catalog.live_url_template.is_none()
        {
            return Err(ConfigError::invalid_value(
                "catalog.live_url_template",
                "required when catalog.provider = \"live\"",
            ));
        }

        if self.notify.enabled && self.notify.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "notify.bind_address",
                format!("'{}' is not a socket address", self.notify.bind_address),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "cachescope".into()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Sampler Configuration
// ----------------------------------------------------------------------------

/// Where interface counters are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerSourceKind {
    /// `/sys/class/net/<iface>/statistics`
    Sysfs,
    /// Portable fallback via the `sysinfo` crate
    Sysinfo,
}

impl Default for SamplerSourceKind {
    fn default() -> Self {
        SamplerSourceKind::Sysfs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick interval in milliseconds
    #[serde(default = "default_tick_interval")]
    #[validate(range(min = 100, max = 60000))]
    pub tick_interval_ms: u64,

    /// Samples older than this are pruned every tick
    #[serde(default = "default_retention")]
    #[validate(range(min = 60))]
    pub retention_secs: u64,

    #[serde(default)]
    pub source: SamplerSourceKind,

    /// Root of the per-interface sysfs tree
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Interface denylist rules: `veth*` prefix, `=lo` exact name,
    /// anything else is a substring of the name or description
    #[serde(default = "default_denylist")]
    #[validate(custom = "validate_denylist")]
    pub denylist: Vec<String>,

    /// Skip interfaces whose operational state is not up
    #[serde(default = "default_true")]
    pub require_up: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval(),
            retention_secs: default_retention(),
            source: SamplerSourceKind::default(),
            sysfs_root: default_sysfs_root(),
            denylist: default_denylist(),
            require_up: true,
        }
    }
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_retention() -> u64 {
    DEFAULT_RETENTION_SECS
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

fn default_denylist() -> Vec<String> {
    ["Virtual", "Pseudo", "Local", "veth*", "=lo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn validate_denylist(rules: &Vec<String>) -> Result<(), ValidationError> {
    if rules.iter().any(|r| r.trim().is_empty() || r == "*" || r == "=") {
        return Err(ValidationError::new("empty_denylist_rule"));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Events Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventsConfig {
    /// Cap applied when a caller passes limit 0
    #[serde(default = "default_event_limit")]
    #[validate(range(min = 1))]
    pub default_limit: usize,

    /// Size of the slice fetched on each refresh
    #[serde(default = "default_delta_limit")]
    #[validate(range(min = 1))]
    pub delta_limit: usize,

    /// Maximum entries a live view holds
    #[serde(default = "default_working_set_cap")]
    #[validate(range(min = 1))]
    pub working_set_cap: usize,

    /// The one source tag backed by the catalog
    #[serde(default = "default_catalog_source_tag")]
    #[validate(length(min = 1))]
    pub catalog_source_tag: String,

    /// Drop events that never moved a byte from recent/aggregate views
    #[serde(default = "default_true")]
    pub require_traffic: bool,

    /// Ordering key shared by queries and the merge engine
    #[serde(default)]
    pub order_key: OrderKey,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            default_limit: default_event_limit(),
            delta_limit: default_delta_limit(),
            working_set_cap: default_working_set_cap(),
            catalog_source_tag: default_catalog_source_tag(),
            require_traffic: true,
            order_key: OrderKey::default(),
        }
    }
}

fn default_event_limit() -> usize {
    DEFAULT_EVENT_LIMIT
}

fn default_delta_limit() -> usize {
    DEFAULT_DELTA_LIMIT
}

fn default_working_set_cap() -> usize {
    DEFAULT_WORKING_SET_CAP
}

fn default_catalog_source_tag() -> String {
    "steam".into()
}

// ----------------------------------------------------------------------------
// Catalog Configuration
// ----------------------------------------------------------------------------

/// Which metadata provider backs the catalog join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogProviderKind {
    Mirror,
    Live,
}

impl Default for CatalogProviderKind {
    fn default() -> Self {
        CatalogProviderKind::Mirror
    }
}

/// Which key catalog versions are filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionKeying {
    /// Versions are keyed by the parent found through the catalog entry
    Parent,
    /// Versions are keyed directly by the event's download key
    Depot,
}

impl Default for VersionKeying {
    fn default() -> Self {
        VersionKeying::Parent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CatalogConfig {
    #[serde(default)]
    pub provider: CatalogProviderKind,

    /// JSON file seeding the local mirror
    #[serde(default)]
    pub mirror_path: Option<PathBuf>,

    /// Live lookup URL, `{key}` is replaced with the parent key
    #[serde(default)]
    #[validate(custom = "validate_url_template")]
    pub live_url_template: Option<String>,

    #[serde(default = "default_http_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub version_keying: VersionKeying,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            provider: CatalogProviderKind::default(),
            mirror_path: None,
            live_url_template: None,
            http_timeout_secs: default_http_timeout(),
            version_keying: VersionKeying::default(),
        }
    }
}

fn default_http_timeout() -> u64 {
    10
}

fn validate_url_template(template: &String) -> Result<(), ValidationError> {
    if !template.contains("{key}") {
        return Err(ValidationError::new("missing_key_placeholder"));
    }
    if !(template.starts_with("http://") || template.starts_with("https://")) {
        return Err(ValidationError::new("unsupported_scheme"));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Notification Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// WebSocket route subscribers connect to
    #[serde(default = "default_hub_path")]
    #[validate(custom = "validate_hub_path")]
    pub hub_path: String,

    /// Name of the single event broadcast to subscribers
    #[serde(default = "default_event_name")]
    #[validate(length(min = 1))]
    pub event_name: String,

    /// Broadcast channel capacity
    #[serde(default = "default_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// How often the change watcher polls the event store revision
    #[serde(default = "default_watch_interval")]
    #[validate(range(min = 50))]
    pub watch_interval_ms: u64,

    /// Minimum spacing between re-fetches in a live view
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    #[serde(default = "default_reconnect_min")]
    #[validate(range(min = 10))]
    pub reconnect_min_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Live views re-sync at least this often even without signals
    #[serde(default = "default_fallback_poll")]
    #[validate(range(min = 1))]
    pub fallback_poll_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            hub_path: default_hub_path(),
            event_name: default_event_name(),
            capacity: default_capacity(),
            watch_interval_ms: default_watch_interval(),
            debounce_ms: default_debounce(),
            reconnect_min_ms: default_reconnect_min(),
            reconnect_max_ms: default_reconnect_max(),
            fallback_poll_secs: default_fallback_poll(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8765".into()
}

fn default_hub_path() -> String {
    "/uirefreshhub".into()
}

fn default_event_name() -> String {
    "RefreshUI".into()
}

fn default_capacity() -> usize {
    256
}

fn default_watch_interval() -> u64 {
    1000
}

fn default_debounce() -> u64 {
    250
}

fn default_reconnect_min() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_fallback_poll() -> u64 {
    30
}

fn validate_hub_path(path: &String) -> Result<(), ValidationError> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(ValidationError::new("hub_path_must_be_absolute"));
    }
    Ok(())
}
