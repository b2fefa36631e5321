// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Bounded-retention nonce store used to reject replayed handshake messages.
//!
//! Entries live for a fixed TTL. Expired entries are purged lazily on lookup and
//! in bulk once the table crosses its high-water mark, at most once per tenth of
//! the TTL, so memory stays bounded by the nonce arrival rate times the TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::config::ReplayConfig;
use crate::lock;

/// Tracks handshake nonces to prevent replay attacks.
pub trait ReplayCache: Send + Sync {
    /// Returns true iff `nonce` was marked within the retention window.
    fn seen(&self, nonce: &str, now: u64) -> bool;

    /// Records `nonce` as seen at `now`.
    fn mark(&self, nonce: &str, now: u64);

    /// Atomically checks and records `nonce`, returning true if it was already
    /// present. Concurrent callers presenting the same nonce observe exactly one
    /// `false`.
    fn replay_seen_and_mark(&self, nonce: &str, now: u64) -> bool;
}

#[derive(Debug, Default)]
struct Entries {
    marked: HashMap<String, u64>,
    last_sweep: Option<u64>,
}

/// In-memory [`ReplayCache`] guarded by a single mutex.
#[derive(Debug)]
pub struct NonceCache {
    entries: Mutex<Entries>,
    ttl_ms: u64,
    sweep_interval_ms: u64,
    high_water: usize,
}

impl NonceCache {
    #[must_use]
    pub fn new(ttl: Duration, high_water: usize) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            entries: Mutex::new(Entries::default()),
            ttl_ms,
            sweep_interval_ms: (ttl_ms / 10).max(1),
            high_water: high_water.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self::new(config.ttl(), config.high_water)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).marked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry older than the TTL, returning how many were removed.
    pub fn purge(&self, now: u64) -> usize {
        let mut entries = lock(&self.entries);
        self.purge_locked(&mut entries, now)
    }

    fn is_fresh(&self, marked_at: u64, now: u64) -> bool {
        now.saturating_sub(marked_at) < self.ttl_ms
    }

    fn purge_locked(&self, entries: &mut Entries, now: u64) -> usize {
        let before = entries.marked.len();
        entries
            .marked
            .retain(|_, marked_at| now.saturating_sub(*marked_at) < self.ttl_ms);
        entries.last_sweep = Some(now);
        let removed = before - entries.marked.len();
        if removed > 0 {
            debug!(target: "replay", removed, remaining = entries.marked.len(), "purged expired nonces");
        }
        removed
    }

    fn insert_locked(&self, entries: &mut Entries, nonce: &str, now: u64) {
        entries.marked.insert(nonce.to_string(), now);
        let sweep_due = entries
            .last_sweep
            .map_or(true, |last| now.saturating_sub(last) >= self.sweep_interval_ms);
        if entries.marked.len() > self.high_water && sweep_due {
            self.purge_locked(entries, now);
        }
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::from_config(&ReplayConfig::default())
    }
}

impl ReplayCache for NonceCache {
    fn seen(&self, nonce: &str, now: u64) -> bool {
        let mut entries = lock(&self.entries);
        match entries.marked.get(nonce) {
            Some(&marked_at) if self.is_fresh(marked_at, now) => true,
            Some(_) => {
                entries.marked.remove(nonce);
                false
            }
            None => false,
        }
    }

    fn mark(&self, nonce: &str, now: u64) {
        let mut entries = lock(&self.entries);
        self.insert_locked(&mut entries, nonce, now);
    }

    fn replay_seen_and_mark(&self, nonce: &str, now: u64) -> bool {
        let mut entries = lock(&self.entries);
        if let Some(&marked_at) = entries.marked.get(nonce) {
            if self.is_fresh(marked_at, now) {
                return true;
            }
        }
        self.insert_locked(&mut entries, nonce, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn seen_tracks_retention_window() {
        let cache = NonceCache::new(TTL, 10_000);
        assert!(!cache.seen("n1", 0));
        cache.mark("n1", 0);
        assert!(cache.seen("n1", 1));
        assert!(cache.seen("n1", 299_999));
        assert!(!cache.seen("n1", 300_000));
        // The expired entry was purged by the lookup above.
        assert!(cache.is_empty());
    }

    #[test]
    fn seen_and_mark_reports_duplicates_once() {
        let cache = NonceCache::new(TTL, 10_000);
        assert!(!cache.replay_seen_and_mark("abc", 10));
        assert!(cache.replay_seen_and_mark("abc", 11));
        assert!(!cache.replay_seen_and_mark("abc", 10 + 300_000));
    }

    #[test]
    fn cleanup_runs_only_past_high_water() {
        let cache = NonceCache::new(Duration::from_millis(100), 3);
        cache.mark("a", 0);
        cache.mark("b", 0);
        cache.mark("c", 0);
        assert_eq!(cache.len(), 3);
        // Crossing the mark evicts the expired trio but keeps the fresh entry.
        cache.mark("d", 500);
        assert_eq!(cache.len(), 1);
        assert!(cache.seen("d", 501));
    }

    #[test]
    fn sweeps_past_high_water_are_spaced_out() {
        // TTL 1000 allows one high-water sweep per 100ms.
        let cache = NonceCache::new(Duration::from_millis(1000), 2);
        cache.mark("a", 0);
        cache.mark("b", 950);
        cache.mark("c", 950);
        assert_eq!(cache.len(), 3);
        // "a" has expired, but the sweep at 950 is too recent to repeat.
        cache.mark("d", 1010);
        assert_eq!(cache.len(), 4);
        cache.mark("e", 1050);
        assert_eq!(cache.len(), 4);
        assert!(!cache.seen("a", 1050));
        // An explicit purge is never deferred.
        assert_eq!(cache.purge(1950), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_claims_admit_exactly_one_winner() {
        let cache = Arc::new(NonceCache::new(TTL, 10_000));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if !cache.replay_seen_and_mark("shared", 5) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn mark_then_seen_within_ttl(nonce in "[a-f0-9]{1,64}", at in 0u64..1_000_000, delta in 0u64..300_000) {
            let cache = NonceCache::new(TTL, 10_000);
            prop_assert!(!cache.seen(&nonce, at));
            cache.mark(&nonce, at);
            prop_assert!(cache.seen(&nonce, at + delta));
            prop_assert!(!cache.seen(&nonce, at + 300_000));
        }
    }
}
