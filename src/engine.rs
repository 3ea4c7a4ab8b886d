//! Engine lifecycle.
//!
//! Builds every component over one shared store, runs the background tasks
//! (rate sampler, change watcher, refresh hub server) and shuts them down on
//! SIGINT/SIGTERM or [`Engine::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accessor::{EventAccessor, EventQuery};
use crate::catalog::{provider_from_config, CatalogJoin, MetadataProvider};
use crate::config::EngineConfig;
use crate::error::CacheScopeResult;
use crate::exclusions::ExclusionList;
use crate::live::{LiveView, LiveViewSettings, LocalFeed};
use crate::notify::{self, ChangeWatcher, HubStatsSnapshot, RefreshHub};
use crate::sampler::{RateSampler, RateSeries, SamplerStats};
use crate::store::MemoryStore;
use crate::ENGINE_VERSION;

// ----------------------------------------------------------------------------
// Engine State
// ----------------------------------------------------------------------------

pub struct Engine {
    config: EngineConfig,
    instance_id: Uuid,
    store: Arc<MemoryStore>,
    sampler: Arc<RateSampler>,
    series: RateSeries,
    accessor: Arc<EventAccessor>,
    join: Arc<CatalogJoin>,
    exclusions: ExclusionList,
    hub: Arc<RefreshHub>,
    cancel: CancellationToken,
    running: AtomicBool,
    start_time: Instant,
}

impl Engine {
    /// Build an engine on a fresh in-memory store.
    pub fn new(config: EngineConfig) -> CacheScopeResult<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Build an engine on an existing store, with the metadata provider
    /// selected in configuration.
    pub fn with_store(config: EngineConfig, store: Arc<MemoryStore>) -> CacheScopeResult<Self> {
        let metadata = provider_from_config(&config.catalog)?;
        Ok(Self::with_parts(config, store, metadata))
    }

    pub fn with_parts(
        config: EngineConfig,
        store: Arc<MemoryStore>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        let sampler = Arc::new(RateSampler::from_config(&config.sampler, store.clone()));
        let series = RateSeries::new(store.clone(), store.clone());
        let accessor = Arc::new(EventAccessor::new(store.clone(), store.clone(), &config.events));
        let join = Arc::new(CatalogJoin::from_config(
            store.clone(),
            metadata,
            &config.events,
            &config.catalog,
        ));
        let exclusions = ExclusionList::new(store.clone());
        let hub = Arc::new(RefreshHub::new(config.notify.capacity));

        Self {
            config,
            instance_id: Uuid::now_v7(),
            store,
            sampler,
            series,
            accessor,
            join,
            exclusions,
            hub,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn sampler(&self) -> &Arc<RateSampler> {
        &self.sampler
    }

    pub fn series(&self) -> &RateSeries {
        &self.series
    }

    pub fn accessor(&self) -> &Arc<EventAccessor> {
        &self.accessor
    }

    pub fn catalog_join(&self) -> &Arc<CatalogJoin> {
        &self.join
    }

    pub fn exclusions(&self) -> &ExclusionList {
        &self.exclusions
    }

    pub fn hub(&self) -> &Arc<RefreshHub> {
        &self.hub
    }

    /// A live view over this engine's events, not yet subscribed.
    ///
    /// Drive it with [`LiveView::run`] and a receiver from [`Engine::hub`].
    pub fn live_view(&self, query: EventQuery) -> LiveView {
        let feed = LocalFeed::new(self.accessor.clone(), self.join.clone(), query);
        LiveView::new(
            Arc::new(feed),
            LiveViewSettings::from_config(&self.config.events, &self.config.notify),
            self.accessor.order_key(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Token cancelled when the engine stops. Child tasks owned by callers
    /// (live views, subscribers) should hang off it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!(target: "cachescope::engine", "Shutdown requested");
        self.cancel.cancel();
    }

    /// Run until a shutdown signal arrives or [`Engine::shutdown`] is called.
    pub async fn run(&self) -> CacheScopeResult<()> {
        info!(
            target: "cachescope::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            instance_id = %self.instance_id,
            "Starting CacheScope engine"
        );

        self.running.store(true, AtomicOrdering::Release);
        let tasks = self.spawn_tasks();

        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!(target: "cachescope::engine", "Shutdown notification received");
            }
            _ = shutdown_signal() => {
                self.cancel.cancel();
            }
        }

        info!(target: "cachescope::engine", tasks = tasks.len(), "Starting graceful shutdown");
        let shutdown_start = Instant::now();
        let timeout = Duration::from_secs(self.config.engine.shutdown_timeout_secs);

        let aborts: Vec<_> = tasks.iter().map(|(_, h)| h.abort_handle()).collect();
        let names: Vec<_> = tasks.iter().map(|(name, _)| *name).collect();
        let handles = tasks.into_iter().map(|(_, h)| h);

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(target: "cachescope::engine", task = name, error = %e, "Task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!(
                    target: "cachescope::engine",
                    timeout_secs = timeout.as_secs(),
                    "Tasks did not stop in time, aborting"
                );
                aborts.iter().for_each(|a| a.abort());
            }
        }

        self.running.store(false, AtomicOrdering::Release);
        info!(
            target: "cachescope::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );
        Ok(())
    }

    fn spawn_tasks(&self) -> Vec<(&'static str, JoinHandle<()>)> {
        let mut tasks = Vec::new();

        if self.config.sampler.enabled {
            let sampler = self.sampler.clone();
            tasks.push(("sampler", tokio::spawn(sampler.run(self.cancel.child_token()))));
        } else {
            info!(target: "cachescope::engine", "Rate sampler disabled");
        }

        let watcher = ChangeWatcher::new(
            self.store.clone(),
            self.hub.clone(),
            Duration::from_millis(self.config.notify.watch_interval_ms),
        );
        tasks.push(("watcher", tokio::spawn(watcher.run(self.cancel.child_token()))));

        if self.config.notify.enabled {
            let hub = self.hub.clone();
            let config = self.config.notify.clone();
            let cancel = self.cancel.child_token();
            tasks.push((
                "hub",
                tokio::spawn(async move {
                    if let Err(e) = notify::serve(hub, &config, cancel).await {
                        error!(target: "cachescope::engine", error = %e, "Refresh hub server failed; consumers fall back to polling");
                    }
                }),
            ));
        }

        tasks
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            instance_id: self.instance_id,
            uptime_secs: self.uptime().as_secs(),
            is_running: self.is_running(),
            sampler: self.sampler.stats(),
            hub: self.hub.stats(),
            subscribers: self.hub.subscriber_count(),
            events: self.store.event_count(),
            samples: self.store.sample_count(),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub instance_id: Uuid,
    pub uptime_secs: u64,
    pub is_running: bool,
    pub sampler: SamplerStats,
    pub hub: HubStatsSnapshot,
    pub subscribers: usize,
    pub events: usize,
    pub samples: usize,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "cachescope::engine", error = %e, "Could not listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "cachescope::engine", error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "cachescope::engine", "Received SIGINT"),
        _ = terminate => info!(target: "cachescope::engine", "Received SIGTERM"),
    }
}
