// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::config::HandshakeConfig;
use crate::lock;

#[derive(Clone, Copy, Debug, Default)]
struct Attempts {
    failures: u32,
    last_failure: u64,
    blocked_until: Option<u64>,
}

/// Counts consecutive failed handshake attempts per transport source and
/// blocks a source for a fixed window once it runs out of retries.
///
/// Keyed by the transport's view of the remote, never by a claimed public key,
/// so a third party replaying someone else's messages cannot get them blocked.
#[derive(Debug)]
pub struct RetryGuard {
    sources: Mutex<HashMap<String, Attempts>>,
    max_retries: u32,
    block_ms: u64,
}

impl RetryGuard {
    #[must_use]
    pub fn new(max_retries: u32, block_ms: u64) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            max_retries: max_retries.max(1),
            block_ms,
        }
    }

    #[must_use]
    pub fn from_config(config: &HandshakeConfig) -> Self {
        Self::new(config.max_retries, config.block_ms)
    }

    /// Returns the unblock time if `source` is currently blocked.
    pub fn blocked_until(&self, source: &str, now: u64) -> Option<u64> {
        let mut sources = lock(&self.sources);
        let attempts = sources.get_mut(source)?;
        match attempts.blocked_until {
            Some(until) if now < until => Some(until),
            Some(_) => {
                sources.remove(source);
                None
            }
            None => None,
        }
    }

    /// Records a failure; returns the unblock time if this failure blocked
    /// the source.
    pub fn record_failure(&self, source: &str, now: u64) -> Option<u64> {
        let mut sources = lock(&self.sources);
        let attempts = sources.entry(source.to_string()).or_default();
        attempts.failures = attempts.failures.saturating_add(1);
        attempts.last_failure = now;
        if attempts.failures >= self.max_retries {
            let until = now.saturating_add(self.block_ms);
            attempts.blocked_until = Some(until);
            attempts.failures = 0;
            warn!(target: "handshake", %source, until, "source blocked after repeated failures");
            return Some(until);
        }
        None
    }

    /// Clears the failure history of `source`.
    pub fn record_success(&self, source: &str) {
        lock(&self.sources).remove(source);
    }

    /// Forgets expired blocks and failure streaks that went quiet for a full
    /// block window, returning how many sources were dropped.
    pub fn purge(&self, now: u64) -> usize {
        let mut sources = lock(&self.sources);
        let before = sources.len();
        sources.retain(|_, attempts| match attempts.blocked_until {
            Some(until) => now < until,
            None => now.saturating_sub(attempts.last_failure) < self.block_ms,
        });
        before - sources.len()
    }

    #[must_use]
    pub fn tracked_sources(&self) -> usize {
        lock(&self.sources).len()
    }

    #[must_use]
    pub fn failures(&self, source: &str) -> u32 {
        lock(&self.sources)
            .get(source)
            .map_or(0, |attempts| attempts.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_max_retries_then_expires() {
        let guard = RetryGuard::new(3, 1_000);
        assert_eq!(guard.record_failure("10.0.0.1", 0), None);
        assert_eq!(guard.record_failure("10.0.0.1", 1), None);
        assert_eq!(guard.failures("10.0.0.1"), 2);
        assert_eq!(guard.record_failure("10.0.0.1", 2), Some(1_002));
        assert_eq!(guard.blocked_until("10.0.0.1", 500), Some(1_002));
        assert_eq!(guard.blocked_until("10.0.0.2", 500), None);
        assert_eq!(guard.blocked_until("10.0.0.1", 1_002), None);
        assert_eq!(guard.failures("10.0.0.1"), 0);
    }

    #[test]
    fn success_resets_failures() {
        let guard = RetryGuard::new(2, 1_000);
        guard.record_failure("peer", 0);
        guard.record_success("peer");
        assert_eq!(guard.record_failure("peer", 1), None);
        assert_eq!(guard.blocked_until("peer", 2), None);
    }

    #[test]
    fn purge_forgets_stale_streaks_and_expired_blocks() {
        let guard = RetryGuard::new(2, 1_000);
        guard.record_failure("blocked", 0);
        guard.record_failure("blocked", 0);
        guard.record_failure("quiet", 100);
        guard.record_failure("recent", 900);
        assert_eq!(guard.purge(500), 0);
        assert_eq!(guard.purge(1_000), 1);
        assert_eq!(guard.tracked_sources(), 2);
        assert_eq!(guard.purge(1_100), 1);
        assert_eq!(guard.failures("quiet"), 0);
        assert_eq!(guard.failures("recent"), 1);
        assert_eq!(guard.purge(1_900), 1);
        assert_eq!(guard.tracked_sources(), 0);
    }
}
