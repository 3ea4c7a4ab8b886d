//! Property tests for the sampler, merge engine and accessor.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;

use cachescope::config::EventsConfig;
use cachescope::error::SamplerResult;
use cachescope::sampler::{per_second, Counters, InterfaceInfo, InterfacePolicy, InterfaceSource};
use cachescope::store::{EventStore, ExclusionStore, RateSeriesStore};
use cachescope::{merge, EnrichedEvent, EventAccessor, EventQuery, MemoryStore, OrderKey, RateSampler, RawEvent, WorkingSet};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
}

fn raw(id: u64, address: &str, updated: DateTime<Utc>, hit: u64) -> RawEvent {
    RawEvent {
        id,
        source_tag: "steam".into(),
        download_key: None,
        download_key_str: None,
        client_address: address.into(),
        created_at: updated - ChronoDuration::seconds(1),
        last_updated_at: updated,
        hit_bytes: hit,
        miss_bytes: 0,
    }
}

/// Enriched event whose key and payload both encode `version`.
fn item(id: u64, version: i64) -> EnrichedEvent {
    EnrichedEvent::passthrough(raw(id, "10.0.0.1", at(version), version as u64))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ----------------------------------------------------------------------------
// Rate computation
// ----------------------------------------------------------------------------

proptest! {
    #[test]
    fn rollback_rate_is_zero(current in 0u64..u64::MAX / 2, back in 1u64..u64::MAX / 2, tick_ms in 1u64..60_000) {
        prop_assert_eq!(per_second(current + back, current, tick_ms), 0);
    }

    #[test]
    fn forward_rate_scales_by_tick(previous in 0u64..1 << 40, delta in 0u64..1 << 40, tick_ms in 1u64..60_000) {
        let rate = per_second(previous, previous + delta, tick_ms);
        prop_assert_eq!(rate as u128, delta as u128 * 1000 / tick_ms as u128);
    }
}

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

/// One interface whose counters grow by a fixed step per read.
struct SteadySource {
    reads: AtomicU64,
}

impl InterfaceSource for SteadySource {
    fn name(&self) -> &'static str {
        "steady"
    }

    fn list_interfaces(&self) -> SamplerResult<Vec<InterfaceInfo>> {
        Ok(vec![InterfaceInfo {
            name: "eth0".into(),
            description: None,
            is_up: true,
            is_loopback: false,
        }])
    }

    fn read_counters(&self, _interface: &str) -> SamplerResult<Counters> {
        let n = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Counters {
            sent_bytes: n * 1_000,
            received_bytes: n * 2_000,
        })
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn no_sample_outlives_retention(
        retention_secs in 60u64..600,
        gaps in prop::collection::vec(1i64..400, 1..40),
    ) {
        runtime().block_on(async {
            let store = Arc::new(MemoryStore::new());
            let sampler = RateSampler::new(
                Box::new(SteadySource { reads: AtomicU64::new(0) }),
                store.clone(),
                InterfacePolicy::new(Vec::<String>::new().as_slice(), true),
                Duration::from_millis(500),
                Duration::from_secs(retention_secs),
            );

            let mut now = at(0);
            sampler.tick_at(now).await.unwrap();
            for gap in gaps {
                now = now + ChronoDuration::seconds(gap);
                sampler.tick_at(now).await.unwrap();

                let cutoff = now - ChronoDuration::seconds(retention_secs as i64);
                if let Some(oldest) = store.oldest_sample_at().await.unwrap() {
                    assert!(oldest >= cutoff, "sample at {oldest} survived cutoff {cutoff}");
                }
                let latest = store.latest("eth0").await.unwrap().unwrap();
                assert_eq!(latest.timestamp, now);
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Merge
// ----------------------------------------------------------------------------

fn arb_items(max_id: u64) -> impl Strategy<Value = Vec<EnrichedEvent>> {
    prop::collection::vec((0..max_id, 0i64..50), 0..40)
        .prop_map(|pairs| pairs.into_iter().map(|(id, v)| item(id, v)).collect())
}

fn assert_well_formed(set: &[EnrichedEvent], cap: usize, key: OrderKey) -> Result<(), TestCaseError> {
    prop_assert!(set.len() <= cap);
    let ids: HashSet<u64> = set.iter().map(EnrichedEvent::id).collect();
    prop_assert_eq!(ids.len(), set.len());
    for pair in set.windows(2) {
        prop_assert!(key.compare(&pair[0].event, &pair[1].event).is_lt());
    }
    Ok(())
}

/// Per id: base version, whether it is in W / D1 / D2, and how far each
/// delta moves its key forward.
type Plan = BTreeMap<u64, (i64, bool, bool, bool, i64, i64)>;

fn arb_plan() -> impl Strategy<Value = Plan> {
    prop::collection::btree_map(
        0u64..60,
        (0i64..1_000, any::<bool>(), any::<bool>(), any::<bool>(), 0i64..100, 0i64..100),
        0..40,
    )
}

proptest! {
    #[test]
    fn empty_delta_is_identity(page in arb_items(30), cap in 1usize..25) {
        let set = WorkingSet::from_page(page, cap, OrderKey::LastUpdated);
        let merged = merge(set.items(), &[], cap, OrderKey::LastUpdated);
        prop_assert_eq!(merged.as_slice(), set.items());
    }

    #[test]
    fn merge_is_capped_unique_and_ordered(
        page in arb_items(30),
        delta in arb_items(60),
        cap in 1usize..25,
        created in any::<bool>(),
    ) {
        let key = if created { OrderKey::Created } else { OrderKey::LastUpdated };
        let working = WorkingSet::from_page(page, cap, key);
        let merged = merge(working.items(), &delta, cap, key);
        assert_well_formed(&merged, cap, key)?;
    }

    #[test]
    fn merge_is_idempotent(page in arb_items(30), delta in arb_items(60), cap in 1usize..25) {
        let working = WorkingSet::from_page(page, cap, OrderKey::LastUpdated);
        let once = merge(working.items(), &delta, cap, OrderKey::LastUpdated);
        let twice = merge(&once, &delta, cap, OrderKey::LastUpdated);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn sequential_deltas_equal_concatenated_delta(plan in arb_plan(), cap in 1usize..25) {
        let mut page = Vec::new();
        let mut d1 = Vec::new();
        let mut d2 = Vec::new();
        for (&id, &(base, in_w, in_d1, in_d2, step1, step2)) in &plan {
            if in_w {
                page.push(item(id, base));
            }
            if in_d1 {
                d1.push(item(id, base + step1));
            }
            if in_d2 {
                d2.push(item(id, base + step1 + step2));
            }
        }

        let working = WorkingSet::from_page(page, cap, OrderKey::LastUpdated);
        let stepwise = merge(
            &merge(working.items(), &d1, cap, OrderKey::LastUpdated),
            &d2,
            cap,
            OrderKey::LastUpdated,
        );
        let combined: Vec<EnrichedEvent> = d1.iter().chain(d2.iter()).cloned().collect();
        let at_once = merge(working.items(), &combined, cap, OrderKey::LastUpdated);

        prop_assert_eq!(stepwise, at_once);
    }
}

/// Several copies of a handful of ids with assorted versions, shuffled so an
/// older copy often arrives after a newer one.
fn arb_shuffled_copies() -> impl Strategy<Value = Vec<(u64, i64)>> {
    prop::collection::vec((0u64..8, 0i64..50), 1..48).prop_shuffle()
}

proptest! {
    #[test]
    fn held_copy_is_the_newest_seen(copies in arb_shuffled_copies(), split in 0usize..48) {
        let split = split.min(copies.len());
        let (head, tail) = copies.split_at(split);

        let page: Vec<EnrichedEvent> = head.iter().map(|&(id, v)| item(id, v)).collect();
        let mut working = WorkingSet::from_page(page, 64, OrderKey::LastUpdated);

        let mut newest: BTreeMap<u64, i64> = BTreeMap::new();
        for &(id, v) in head {
            let slot = newest.entry(id).or_insert(v);
            *slot = (*slot).max(v);
        }
        let mut expected_stale = 0;
        for &(id, v) in tail {
            match newest.get_mut(&id) {
                Some(held) if v < *held => expected_stale += 1,
                Some(held) => *held = v,
                None => {
                    newest.insert(id, v);
                }
            }
        }

        let delta: Vec<EnrichedEvent> = tail.iter().map(|&(id, v)| item(id, v)).collect();
        let outcome = working.merge(delta);
        prop_assert_eq!(outcome.stale, expected_stale);

        prop_assert_eq!(working.items().len(), newest.len());
        for held in working.items() {
            prop_assert_eq!(Some(&(held.event.hit_bytes as i64)), newest.get(&held.id()));
            prop_assert_eq!(held.event.last_updated_at, at(newest[&held.id()]));
        }
        assert_well_formed(working.items(), 64, OrderKey::LastUpdated)?;
    }
}

// ----------------------------------------------------------------------------
// Exclusions
// ----------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn excluded_address_never_returned(
        events in prop::collection::vec((0usize..4, 0i64..24 * 30, 1u64..1_000), 1..30),
        days in -2i64..40,
    ) {
        const ADDRESSES: [&str; 4] = ["10.0.0.5", "10.0.0.6", "10.0.0.7", "192.168.1.20"];

        runtime().block_on(async {
            let store = Arc::new(MemoryStore::new());
            let now = Utc::now();
            for (i, &(addr, hours_ago, hit)) in events.iter().enumerate() {
                let updated = now - ChronoDuration::hours(hours_ago) - ChronoDuration::minutes(30);
                store.upsert_event(raw(i as u64 + 1, ADDRESSES[addr], updated, hit)).await.unwrap();
            }
            store.insert_exclusion("10.0.0.5").await.unwrap();

            let config = EventsConfig::default();
            let accessor = EventAccessor::new(store.clone(), store.clone(), &config);
            let base = EventQuery::new().days(days).limit(1_000).excluding_addresses(false);

            let all = accessor.recent(&base).await.unwrap();
            let filtered = accessor.recent(&base.excluding_addresses(true)).await.unwrap();

            assert!(filtered.iter().all(|e| e.client_address != "10.0.0.5"));
            let expected: Vec<u64> = all
                .iter()
                .filter(|e| e.client_address != "10.0.0.5")
                .map(|e| e.id)
                .collect();
            assert_eq!(filtered.iter().map(|e| e.id).collect::<Vec<_>>(), expected);

            let unfiltered_has_excluded = events.iter().any(|&(addr, hours_ago, _)| {
                addr == 0 && (days <= 0 || hours_ago < days * 24)
            });
            assert_eq!(all.iter().any(|e| e.client_address == "10.0.0.5"), unfiltered_has_excluded);
        });
    }
}
