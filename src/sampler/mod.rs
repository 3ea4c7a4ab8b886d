//! Interface rate sampler.
//!
//! Every tick reads absolute byte counters for each eligible interface,
//! differences them against the previous tick's snapshot and persists the
//! per-second rate. Samples older than the retention window are pruned in the
//! same store batch, so the series stays bounded however long the process
//! runs.
//!
//! ```text
//!   InterfaceSource ──► InterfacePolicy ──► snapshot diff ──► RateSeriesStore
//!        (sysfs)          (denylist)         (ahash map)       append + prune
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SamplerConfig;
use crate::error::SamplerResult;
use crate::model::RateSample;
use crate::store::RateSeriesStore;

mod policy;
mod series;
mod source;

pub use policy::{DenyRule, Eligibility, InterfacePolicy};
pub use series::{RateSeries, DEFAULT_RECENT_MINUTES, GRAPH_INTERFACE_SETTING};
pub use source::{
    from_config as source_from_config, Counters, InterfaceInfo, InterfaceSource,
    SysfsInterfaceSource, SysinfoInterfaceSource,
};

#[cfg(test)]
pub(crate) use source::fixtures;

// ----------------------------------------------------------------------------
// Rate Computation
// ----------------------------------------------------------------------------

/// Per-second rate between two absolute counter readings one tick apart.
///
/// A counter that went backwards (device reset, wrap) yields 0.
#[inline]
pub fn per_second(previous: u64, current: u64, tick_ms: u64) -> u64 {
    if current < previous {
        return 0;
    }
    let delta = (current - previous) as u128;
    let rate = delta * 1000 / tick_ms.max(1) as u128;
    u64::try_from(rate).unwrap_or(u64::MAX)
}

/// Last absolute reading seen for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct InterfaceSnapshot {
    counters: Counters,
}

// ----------------------------------------------------------------------------
// Tick Reports & Statistics
// ----------------------------------------------------------------------------

/// Result of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Samples written this tick
    pub sampled: usize,
    /// Interfaces filtered out by policy
    pub skipped: usize,
    /// Interfaces whose counters could not be read
    pub failed: usize,
    /// Rows removed by retention
    pub pruned: usize,
}

/// Cumulative sampler statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplerStats {
    pub ticks: u64,
    pub samples_written: u64,
    pub read_failures: u64,
    pub enumeration_failures: u64,
    pub rows_pruned: u64,
    pub last_tick_us: u64,
    pub max_tick_us: u64,
}

#[derive(Default)]
struct SamplerStatsTracker {
    ticks: AtomicU64,
    samples_written: AtomicU64,
    read_failures: AtomicU64,
    enumeration_failures: AtomicU64,
    rows_pruned: AtomicU64,
    last_tick_us: AtomicU64,
    max_tick_us: AtomicU64,
}

impl SamplerStatsTracker {
    fn record_tick(&self, report: &TickReport, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
        self.samples_written
            .fetch_add(report.sampled as u64, AtomicOrdering::Relaxed);
        self.read_failures
            .fetch_add(report.failed as u64, AtomicOrdering::Relaxed);
        self.rows_pruned
            .fetch_add(report.pruned as u64, AtomicOrdering::Relaxed);
        self.last_tick_us.store(us, AtomicOrdering::Relaxed);
        self.max_tick_us.fetch_max(us, AtomicOrdering::Relaxed);
    }

    fn record_enumeration_failure(&self) {
        self.enumeration_failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> SamplerStats {
        SamplerStats {
            ticks: self.ticks.load(AtomicOrdering::Relaxed),
            samples_written: self.samples_written.load(AtomicOrdering::Relaxed),
            read_failures: self.read_failures.load(AtomicOrdering::Relaxed),
            enumeration_failures: self.enumeration_failures.load(AtomicOrdering::Relaxed),
            rows_pruned: self.rows_pruned.load(AtomicOrdering::Relaxed),
            last_tick_us: self.last_tick_us.load(AtomicOrdering::Relaxed),
            max_tick_us: self.max_tick_us.load(AtomicOrdering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Rate Sampler
// ----------------------------------------------------------------------------

/// Owns the previous-snapshot map; nothing else reads or writes it.
pub struct RateSampler {
    source: Box<dyn InterfaceSource>,
    store: Arc<dyn RateSeriesStore>,
    policy: InterfacePolicy,
    tick_interval: Duration,
    retention: chrono::Duration,
    snapshots: Mutex<AHashMap<CompactString, InterfaceSnapshot>>,
    /// Serializes ticks
    tick_lock: TokioMutex<()>,
    stats: SamplerStatsTracker,
}

impl RateSampler {
    pub fn new(
        source: Box<dyn InterfaceSource>,
        store: Arc<dyn RateSeriesStore>,
        policy: InterfacePolicy,
        tick_interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            source,
            store,
            policy,
            tick_interval,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            snapshots: Mutex::new(AHashMap::new()),
            tick_lock: TokioMutex::new(()),
            stats: SamplerStatsTracker::default(),
        }
    }

    pub fn from_config(config: &SamplerConfig, store: Arc<dyn RateSeriesStore>) -> Self {
        Self::new(
            source_from_config(config),
            store,
            InterfacePolicy::new(config.denylist.as_slice(), config.require_up),
            Duration::from_millis(config.tick_interval_ms),
            Duration::from_secs(config.retention_secs),
        )
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats.snapshot()
    }

    /// Every interface the source reports, with the policy verdict.
    pub fn survey(&self) -> SamplerResult<Vec<(InterfaceInfo, Eligibility, Option<Counters>)>> {
        Ok(self
            .source
            .list_interfaces()?
            .into_iter()
            .map(|info| {
                let verdict = self.policy.evaluate(&info);
                let counters = self.source.read_counters(&info.name).ok();
                (info, verdict, counters)
            })
            .collect())
    }

    /// Run one tick stamped with the current time.
    pub async fn tick(&self) -> SamplerResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick stamped with `now`. Concurrent callers are serialized.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> SamplerResult<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let start = Instant::now();
        let mut report = TickReport::default();

        let cutoff = now - self.retention;

        let interfaces = match self.source.list_interfaces() {
            Ok(list) => list,
            Err(e) => {
                // Snapshots stay put so the next good tick still has baselines.
                self.stats.record_enumeration_failure();
                warn!(target: "cachescope::sampler", source = self.source.name(), error = %e, "Interface enumeration failed");
                report.pruned = self.store.append_and_prune(Vec::new(), cutoff).await?;
                self.stats.record_tick(&report, start.elapsed());
                return Ok(report);
            }
        };

        let tick_ms = self.tick_interval.as_millis() as u64;
        let mut samples = Vec::with_capacity(interfaces.len());
        let mut seen = AHashSet::with_capacity(interfaces.len());

        {
            let mut snapshots = self.snapshots.lock();

            for info in &interfaces {
                let verdict = self.policy.evaluate(info);
                if !verdict.is_eligible() {
                    report.skipped += 1;
                    continue;
                }
                seen.insert(info.name.clone());

                let counters = match self.source.read_counters(&info.name) {
                    Ok(c) => c,
                    Err(e) => {
                        report.failed += 1;
                        warn!(target: "cachescope::sampler", interface = %info.name, error = %e, "Skipping interface this tick");
                        continue;
                    }
                };

                if let Some(prev) = snapshots.get(&info.name) {
                    samples.push(RateSample {
                        interface: info.name.clone(),
                        timestamp: now,
                        sent_bytes_per_sec: per_second(
                            prev.counters.sent_bytes,
                            counters.sent_bytes,
                            tick_ms,
                        ),
                        received_bytes_per_sec: per_second(
                            prev.counters.received_bytes,
                            counters.received_bytes,
                            tick_ms,
                        ),
                    });
                }

                snapshots.insert(info.name.clone(), InterfaceSnapshot { counters });
            }

            snapshots.retain(|name, _| seen.contains(name));
        }

        report.sampled = samples.len();
        report.pruned = self.store.append_and_prune(samples, cutoff).await?;

        let elapsed = start.elapsed();
        self.stats.record_tick(&report, elapsed);

        trace!(
            target: "cachescope::sampler",
            samples = report.sampled,
            skipped = report.skipped,
            failed = report.failed,
            pruned = report.pruned,
            elapsed_us = elapsed.as_micros() as u64,
            "Tick complete"
        );

        Ok(report)
    }

    /// Tick on the configured interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            target: "cachescope::sampler",
            source = self.source.name(),
            interval_ms = self.tick_interval.as_millis() as u64,
            retention_secs = self.retention.num_seconds(),
            "Rate sampler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(target: "cachescope::sampler", error = %e, "Tick failed");
                    }
                }
            }
        }

        let stats = self.stats();
        debug!(target: "cachescope::sampler", ticks = stats.ticks, samples = stats.samples_written, "Rate sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{set_counters, write_iface};
    use super::*;
    use crate::error::SamplerError;
    use crate::model::fixtures::at;
    use crate::store::MemoryStore;
    use test_case::test_case;

    #[test_case(100, 150, 500 => 100; "half second tick doubles")]
    #[test_case(0, 1_000, 1_000 => 1_000; "one second tick")]
    #[test_case(500, 100, 500 => 0; "rollback is zero")]
    #[test_case(42, 42, 500 => 0; "idle")]
    #[test_case(0, u64::MAX, 100 => u64::MAX; "saturates")]
    fn test_per_second(prev: u64, cur: u64, tick_ms: u64) -> u64 {
        per_second(prev, cur, tick_ms)
    }

    fn sampler(root: &std::path::Path, store: Arc<MemoryStore>) -> RateSampler {
        RateSampler::new(
            Box::new(SysfsInterfaceSource::new(root)),
            store,
            InterfacePolicy::new(&["veth*", "=lo"], true),
            Duration::from_millis(500),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_first_tick_only_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 1_000, 2_000);
        let store = Arc::new(MemoryStore::new());
        let sampler = sampler(dir.path(), store.clone());

        let report = sampler.tick_at(at(0)).await.unwrap();
        assert_eq!(report.sampled, 0);
        assert_eq!(store.sample_count(), 0);

        set_counters(dir.path(), "eth0", 1_500, 3_000);
        let report = sampler.tick_at(at(1)).await.unwrap();
        assert_eq!(report.sampled, 1);

        let latest = store.latest("eth0").await.unwrap().unwrap();
        assert_eq!(latest.sent_bytes_per_sec, 1_000);
        assert_eq!(latest.received_bytes_per_sec, 2_000);
        assert_eq!(latest.timestamp, at(1));
    }

    #[tokio::test]
    async fn test_policy_skips_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 1_000, 1_000);
        write_iface(dir.path(), "veth9", "up", 1, 0, 0);
        write_iface(dir.path(), "lo", "unknown", 772, 0, 0);
        let store = Arc::new(MemoryStore::new());
        let sampler = sampler(dir.path(), store.clone());

        let report = sampler.tick_at(at(0)).await.unwrap();
        assert_eq!(report.skipped, 2);

        set_counters(dir.path(), "eth0", 10, 10);
        sampler.tick_at(at(1)).await.unwrap();

        let latest = store.latest("eth0").await.unwrap().unwrap();
        assert_eq!(latest.sent_bytes_per_sec, 0);
        assert_eq!(latest.received_bytes_per_sec, 0);
    }

    #[tokio::test]
    async fn test_read_failure_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 1_000, 1_000);
        write_iface(dir.path(), "eth1", "up", 1, 0, 0);
        let store = Arc::new(MemoryStore::new());
        let sampler = sampler(dir.path(), store.clone());
        sampler.tick_at(at(0)).await.unwrap();

        std::fs::write(dir.path().join("eth0/statistics/tx_bytes"), "garbage").unwrap();
        set_counters(dir.path(), "eth1", 50, 50);
        let report = sampler.tick_at(at(1)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sampled, 1);

        // eth0 still diffs against the tick-0 reading
        set_counters(dir.path(), "eth0", 1_250, 1_000);
        sampler.tick_at(at(2)).await.unwrap();
        let latest = store.latest("eth0").await.unwrap().unwrap();
        assert_eq!(latest.sent_bytes_per_sec, 500);
        assert_eq!(sampler.stats().read_failures, 1);
    }

    #[tokio::test]
    async fn test_retention_applied_each_tick() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 0, 0);
        let store = Arc::new(MemoryStore::new());
        let sampler = sampler(dir.path(), store.clone());

        sampler.tick_at(at(0)).await.unwrap();
        sampler.tick_at(at(1)).await.unwrap();
        sampler.tick_at(at(2)).await.unwrap();
        assert_eq!(store.sample_count(), 2);

        let report = sampler.tick_at(at(3_602)).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(store.oldest_sample_at().await.unwrap().unwrap() >= at(2));
    }

    /// Lists `eth0` every time except the listed call numbers.
    struct FlakyListing {
        listings: AtomicU64,
        failing: &'static [u64],
        reads: AtomicU64,
    }

    impl InterfaceSource for FlakyListing {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn list_interfaces(&self) -> SamplerResult<Vec<InterfaceInfo>> {
            let call = self.listings.fetch_add(1, AtomicOrdering::Relaxed);
            if self.failing.contains(&call) {
                return Err(SamplerError::EnumerationFailed {
                    source_name: "flaky".into(),
                    message: "listing unavailable".into(),
                });
            }
            Ok(vec![InterfaceInfo {
                name: "eth0".into(),
                description: None,
                is_up: true,
                is_loopback: false,
            }])
        }

        fn read_counters(&self, _interface: &str) -> SamplerResult<Counters> {
            let n = self.reads.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            Ok(Counters {
                sent_bytes: n * 1_000,
                received_bytes: n * 4_000,
            })
        }
    }

    #[tokio::test]
    async fn test_transient_enumeration_failure_keeps_baselines() {
        let store = Arc::new(MemoryStore::new());
        let sampler = RateSampler::new(
            Box::new(FlakyListing {
                listings: AtomicU64::new(0),
                failing: &[1],
                reads: AtomicU64::new(0),
            }),
            store.clone(),
            InterfacePolicy::new::<&str>(&[], true),
            Duration::from_millis(500),
            Duration::from_secs(3600),
        );

        assert_eq!(sampler.tick_at(at(0)).await.unwrap().sampled, 0);
        assert_eq!(sampler.tick_at(at(1)).await.unwrap(), TickReport::default());

        let report = sampler.tick_at(at(2)).await.unwrap();
        assert_eq!(report.sampled, 1);

        let latest = store.latest("eth0").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, at(2));
        assert_eq!(latest.sent_bytes_per_sec, 2_000);
        assert_eq!(latest.received_bytes_per_sec, 8_000);
        assert_eq!(sampler.stats().enumeration_failures, 1);
        assert_eq!(sampler.stats().ticks, 3);
    }

    #[tokio::test]
    async fn test_enumeration_failure_still_prunes() {
        let store = Arc::new(MemoryStore::new());
        store
            .append_and_prune(
                vec![RateSample {
                    interface: "eth0".into(),
                    timestamp: at(0),
                    sent_bytes_per_sec: 1,
                    received_bytes_per_sec: 1,
                }],
                at(-10),
            )
            .await
            .unwrap();

        let sampler = sampler(std::path::Path::new("/definitely/not/sysfs"), store.clone());
        let report = sampler.tick_at(at(7_200)).await.unwrap();

        assert_eq!(report.pruned, 1);
        assert_eq!(sampler.stats().enumeration_failures, 1);
    }
}
