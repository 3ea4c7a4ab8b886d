//! Incremental merge of enriched event deltas into a bounded working set.
//!
//! A consumer bootstraps with a full page, then folds small recent slices in
//! as refresh signals arrive. The working set stays sorted by the same key the
//! accessor sorts by, so a merged set and a fresh full page agree on order.

use std::cmp::Ordering;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EnrichedEvent, EventId, RawEvent};

// ----------------------------------------------------------------------------
// Ordering Key
// ----------------------------------------------------------------------------

/// Timestamp that orders events, newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    #[default]
    LastUpdated,
    Created,
}

impl OrderKey {
    #[inline]
    pub fn of(self, event: &RawEvent) -> DateTime<Utc> {
        match self {
            OrderKey::LastUpdated => event.last_updated_at,
            OrderKey::Created => event.created_at,
        }
    }

    /// Key descending, then id descending. Total over distinct ids.
    pub fn compare(self, a: &RawEvent, b: &RawEvent) -> Ordering {
        self.of(b)
            .cmp(&self.of(a))
            .then_with(|| b.id.cmp(&a.id))
    }
}

// ----------------------------------------------------------------------------
// Working Set
// ----------------------------------------------------------------------------

/// What a single merge did to the working set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Ids that were not present before
    pub inserted: usize,
    /// Existing entries overwritten by a not-older version
    pub replaced: usize,
    /// Incoming versions ignored because the held one is newer
    pub stale: usize,
    /// Entries dropped off the tail to respect the cap
    pub evicted: usize,
}

impl MergeOutcome {
    /// Whether the visible contents may have changed.
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.replaced > 0 || self.evicted > 0
    }
}

/// Ordered, capped, id-unique collection of enriched events.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingSet {
    items: Vec<EnrichedEvent>,
    cap: usize,
    order_key: OrderKey,
}

impl WorkingSet {
    pub fn new(cap: usize, order_key: OrderKey) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            cap,
            order_key,
        }
    }

    /// Build a working set from a freshly fetched page.
    pub fn from_page(page: Vec<EnrichedEvent>, cap: usize, order_key: OrderKey) -> Self {
        let mut set = Self::new(cap, order_key);
        set.merge(page);
        set
    }

    /// Fold `delta` into the set.
    ///
    /// An item whose id is already held replaces the held entry when its
    /// ordering key is not older; later items in `delta` win over earlier
    /// ones under the same rule. Unknown ids are added. The result is then
    /// re-sorted and truncated to the cap.
    pub fn merge<I>(&mut self, delta: I) -> MergeOutcome
    where
        I: IntoIterator<Item = EnrichedEvent>,
    {
        let mut outcome = MergeOutcome::default();
        let key = self.order_key;

        let mut index: AHashMap<EventId, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.id(), pos))
            .collect();

        for incoming in delta {
            match index.get(&incoming.id()) {
                Some(&pos) => {
                    if key.of(&incoming.event) >= key.of(&self.items[pos].event) {
                        self.items[pos] = incoming;
                        outcome.replaced += 1;
                    } else {
                        outcome.stale += 1;
                    }
                }
                None => {
                    index.insert(incoming.id(), self.items.len());
                    self.items.push(incoming);
                    outcome.inserted += 1;
                }
            }
        }

        self.items.sort_by(|a, b| key.compare(&a.event, &b.event));

        if self.items.len() > self.cap {
            outcome.evicted = self.items.len() - self.cap;
            self.items.truncate(self.cap);
        }

        outcome
    }

    /// Drop everything and start over from `page`.
    pub fn reset(&mut self, page: Vec<EnrichedEvent>) -> MergeOutcome {
        self.items.clear();
        self.merge(page)
    }

    pub fn items(&self) -> &[EnrichedEvent] {
        &self.items
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.items.iter().map(EnrichedEvent::id).collect()
    }

    pub fn get(&self, id: EventId) -> Option<&EnrichedEvent> {
        self.items.iter().find(|item| item.id() == id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn order_key(&self) -> OrderKey {
        self.order_key
    }

    pub fn into_vec(self) -> Vec<EnrichedEvent> {
        self.items
    }
}

/// Pure form of [`WorkingSet::merge`]: returns the merged sequence without
/// touching `working`.
pub fn merge(
    working: &[EnrichedEvent],
    delta: &[EnrichedEvent],
    cap: usize,
    order_key: OrderKey,
) -> Vec<EnrichedEvent> {
    let mut set = WorkingSet {
        items: working.to_vec(),
        cap,
        order_key,
    };
    set.merge(delta.iter().cloned());
    set.into_vec()
}
