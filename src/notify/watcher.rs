//! Producer side: turns event store writes into refresh signals.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RefreshHub;
use crate::store::EventStore;

/// Polls the event store's revision and signals the hub when it moves.
pub struct ChangeWatcher {
    events: Arc<dyn EventStore>,
    hub: Arc<RefreshHub>,
    interval: Duration,
    last_seen: Option<u64>,
}

impl ChangeWatcher {
    pub fn new(events: Arc<dyn EventStore>, hub: Arc<RefreshHub>, interval: Duration) -> Self {
        Self {
            events,
            hub,
            interval,
            last_seen: None,
        }
    }

    /// One poll. Returns whether a signal was raised.
    ///
    /// The first poll only records the baseline.
    pub async fn poll(&mut self) -> bool {
        let revision = match self.events.revision().await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "cachescope::notify", error = %e, "Could not read event store revision");
                return false;
            }
        };

        let changed = matches!(self.last_seen, Some(prev) if prev != revision);
        self.last_seen = Some(revision);

        if changed {
            let listeners = self.hub.signal();
            debug!(target: "cachescope::notify", revision, listeners, "Event store changed");
        }
        changed
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target: "cachescope::notify", interval_ms = self.interval.as_millis() as u64, "Change watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
    }
}
