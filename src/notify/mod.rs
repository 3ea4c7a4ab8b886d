//! Change notification channel.
//!
//! A payload-free "something changed, re-pull" signal fanned out to every
//! subscriber. Delivery is at-most-once: a subscriber that falls behind sees
//! one coalesced signal instead of a backlog, and one that misses a signal
//! converges on the next one or on its fallback poll.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

mod server;
#[cfg(feature = "websocket")]
mod subscriber;
mod watcher;

pub use server::{router, serve};
#[cfg(feature = "websocket")]
pub use subscriber::{Backoff, RemoteSubscriber};
pub use watcher::ChangeWatcher;

/// The signal itself. Carries nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSignal;

// ----------------------------------------------------------------------------
// Hub Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HubStats {
    signals: AtomicU64,
    unheard: AtomicU64,
    delivered: AtomicU64,
    lagged: AtomicU64,
    coalesced: AtomicU64,
}

impl HubStats {
    fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            signals: self.signals.load(AtomicOrdering::Relaxed),
            unheard: self.unheard.load(AtomicOrdering::Relaxed),
            delivered: self.delivered.load(AtomicOrdering::Relaxed),
            lagged: self.lagged.load(AtomicOrdering::Relaxed),
            coalesced: self.coalesced.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStatsSnapshot {
    /// Signals raised
    pub signals: u64,
    /// Signals raised while nobody was subscribed
    pub unheard: u64,
    /// Signals handed to a receiver
    pub delivered: u64,
    /// Signals a slow receiver skipped over
    pub lagged: u64,
    /// Signals swallowed by debouncing
    pub coalesced: u64,
}

// ----------------------------------------------------------------------------
// Refresh Hub
// ----------------------------------------------------------------------------

/// In-process fan-out of refresh signals.
pub struct RefreshHub {
    sender: broadcast::Sender<RefreshSignal>,
    capacity: usize,
    stats: Arc<HubStats>,
}

impl RefreshHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(HubStats::default()),
        }
    }

    /// Tell every subscriber to re-pull. Returns how many were listening;
    /// nobody listening is not an error.
    pub fn signal(&self) -> usize {
        self.stats.signals.fetch_add(1, AtomicOrdering::Relaxed);
        match self.sender.send(RefreshSignal) {
            Ok(listeners) => listeners,
            Err(_) => {
                self.stats.unheard.fetch_add(1, AtomicOrdering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> RefreshReceiver {
        RefreshReceiver {
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.stats.snapshot()
    }
}

/// One subscriber's end of the hub.
pub struct RefreshReceiver {
    receiver: broadcast::Receiver<RefreshSignal>,
    stats: Arc<HubStats>,
}

impl RefreshReceiver {
    /// Wait for the next signal. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<RefreshSignal> {
        match self.receiver.recv().await {
            Ok(signal) => {
                self.stats.delivered.fetch_add(1, AtomicOrdering::Relaxed);
                Some(signal)
            }
            Err(RecvError::Lagged(skipped)) => {
                self.stats.lagged.fetch_add(skipped, AtomicOrdering::Relaxed);
                self.stats.delivered.fetch_add(1, AtomicOrdering::Relaxed);
                Some(RefreshSignal)
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Wait for a signal, then hold for `spacing` and swallow whatever else
    /// arrives, so a burst costs the caller one re-fetch.
    pub async fn recv_debounced(&mut self, spacing: Duration) -> Option<RefreshSignal> {
        let signal = self.recv().await?;
        if spacing.is_zero() {
            return Some(signal);
        }

        tokio::time::sleep(spacing).await;
        let mut swallowed = 0u64;
        loop {
            match self.receiver.try_recv() {
                Ok(_) => swallowed += 1,
                Err(TryRecvError::Lagged(n)) => swallowed += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if swallowed > 0 {
            self.stats.coalesced.fetch_add(swallowed, AtomicOrdering::Relaxed);
            trace!(target: "cachescope::notify", swallowed, "Coalesced refresh burst");
        }
        Some(signal)
    }
}
