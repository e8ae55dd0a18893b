use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// How long an event id is remembered after its first delivery.
pub const DEDUP_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// In-memory idempotency guard keyed by redemption event id.
///
/// Expirations are tracked in a min-heap drained by a single sweeper task.
#[derive(Clone)]
pub struct DedupCache {
    inner: Arc<Inner>,
}

struct Inner {
    entries: DashMap<String, Instant>,
    expirations: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                expirations: Mutex::new(BinaryHeap::new()),
                ttl,
            }),
        }
    }

    /// Records the id and returns `true` on first sighting within the TTL.
    pub fn check_and_insert(&self, id: &str) -> bool {
        self.check_and_insert_at(id, Instant::now())
    }

    pub fn check_and_insert_at(&self, id: &str, now: Instant) -> bool {
        let ttl = self.inner.ttl;
        match self.inner.entries.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.saturating_duration_since(*occupied.get()) < ttl {
                    return false;
                }
                // expired but not swept yet
                occupied.insert(now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
            }
        }

        if let Ok(mut heap) = self.inner.expirations.lock() {
            heap.push(Reverse((now + ttl, id.to_string())));
        }
        true
    }

    /// Removes every entry whose TTL elapsed at `now`. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let due = {
            let Ok(mut heap) = self.inner.expirations.lock() else {
                return 0;
            };
            let mut due = Vec::new();
            while heap
                .peek()
                .is_some_and(|Reverse((deadline, _))| *deadline <= now)
            {
                if let Some(Reverse((_, id))) = heap.pop() {
                    due.push(id);
                }
            }
            due
        };

        let ttl = self.inner.ttl;
        let removed = due
            .iter()
            .filter(|id| {
                self.inner
                    .entries
                    .remove_if(id.as_str(), |_, seen| {
                        now.saturating_duration_since(*seen) >= ttl
                    })
                    .is_some()
            })
            .count();

        gauge!("dedup_entries").set(self.tracked() as f64);
        removed
    }

    pub fn tracked(&self) -> usize {
        self.inner.entries.len()
    }

    /// Runs the periodic sweeper in the background.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.sweep(Instant::now());
                if removed > 0 {
                    debug!(stage = "dedup", removed, remaining = cache.tracked(), "expired event ids swept");
                }
            }
        })
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_TTL)
    }
}
