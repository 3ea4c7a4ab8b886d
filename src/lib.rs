//! # CacheScope Engine
//!
//! Telemetry aggregation and enrichment for a LAN caching proxy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            CACHESCOPE ENGINE                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  InterfaceSource → RateSampler → RateSeriesStore (append + prune)        │
//! │                                                                          │
//! │  EventStore → EventAccessor → CatalogJoin → LiveView (WorkingSet merge)  │
//! │       │                                          ▲                       │
//! │       └── ChangeWatcher → RefreshHub ─── ws ─────┘                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - The **rate sampler** turns absolute interface byte counters into
//!   per-second rates on a fixed tick and prunes rows past retention.
//! - The **accessor** filters raw download events by time window and client
//!   exclusions; the **catalog join** sizes and labels them.
//! - A **live view** holds one consumer's capped working set and folds small
//!   deltas into it whenever the **refresh hub** says something changed.

pub mod accessor;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod exclusions;
pub mod live;
pub mod logging;
pub mod merge;
pub mod model;
pub mod notify;
pub mod sampler;
pub mod store;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "cachescope-engine";
pub const ENGINE_FULL_NAME: &str = "CacheScope Engine";

/// Sampler tick
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
/// How long rate samples are kept
pub const DEFAULT_RETENTION_SECS: u64 = 3600;
/// Page size when a caller passes no limit
pub const DEFAULT_EVENT_LIMIT: usize = 100;
/// Page size of an incremental refresh
pub const DEFAULT_DELTA_LIMIT: usize = 20;
pub const DEFAULT_WORKING_SET_CAP: usize = 100;

pub use accessor::{EventAccessor, EventQuery};
pub use catalog::{CatalogJoin, MetadataProvider};
pub use config::EngineConfig;
pub use engine::{Engine, EngineStats};
pub use error::{CacheScopeError, CacheScopeResult, RecoveryHint};
pub use exclusions::ExclusionList;
pub use live::{DeltaSource, LiveView, LocalFeed};
pub use merge::{merge, MergeOutcome, OrderKey, WorkingSet};
pub use model::{EnrichedEvent, RateSample, RawEvent};
pub use notify::{RefreshHub, RefreshReceiver};
pub use sampler::{RateSampler, RateSeries};
pub use store::MemoryStore;
