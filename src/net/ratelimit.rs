// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::hash::Hash;

use crate::config::RateLimitConfig;
use crate::identity::PeerKey;
use crate::trust::TrustLevel;

/// Configuration for a token-bucket limiter measured in packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RateLimitParams {
    capacity: u32,
    replenish: u32,
    interval_ms: u64,
}

impl RateLimitParams {
    #[must_use]
    pub const fn new(capacity: u32, replenish: u32, interval_ms: u64) -> Self {
        Self {
            capacity,
            replenish,
            interval_ms,
        }
    }

    #[must_use]
    pub const fn unbounded() -> Self {
        Self::new(u32::MAX, u32::MAX, 0)
    }

    const fn is_unbounded(&self) -> bool {
        self.interval_ms == 0
    }
}

#[derive(Clone, Debug)]
struct TokenBucket {
    tier: TrustLevel,
    capacity: u32,
    tokens: u32,
    replenish: u32,
    interval_ms: u64,
    last_refill: Option<u64>,
}

impl TokenBucket {
    fn new(tier: TrustLevel, params: RateLimitParams) -> Self {
        Self {
            tier,
            capacity: params.capacity,
            tokens: params.capacity,
            replenish: params.replenish,
            interval_ms: params.interval_ms,
            last_refill: None,
        }
    }

    fn refill(&mut self, now: u64) {
        match self.last_refill {
            Some(last) => {
                if now <= last {
                    return;
                }
                let intervals = now.saturating_sub(last) / self.interval_ms;
                if intervals == 0 {
                    return;
                }
                let additional = intervals.saturating_mul(u64::from(self.replenish));
                let new_tokens = u64::from(self.tokens).saturating_add(additional);
                self.tokens = u32::try_from(new_tokens.min(u64::from(self.capacity)))
                    .unwrap_or(self.capacity);
                let advanced = intervals.saturating_mul(self.interval_ms);
                self.last_refill = Some(last.saturating_add(advanced));
            }
            None => {
                self.tokens = self.capacity;
                self.last_refill = Some(now);
            }
        }
    }

    fn try_consume(&mut self, now: u64, tokens: u32) -> bool {
        if self.interval_ms == 0 {
            return true;
        }
        self.refill(now);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// A bucket that has refilled to capacity carries no state worth keeping.
    fn is_idle(&mut self, now: u64) -> bool {
        self.refill(now);
        self.tokens >= self.capacity
    }
}

/// Token-bucket limiter keyed by peer (or transport source) whose budget
/// follows a trust tier.
///
/// A key that changes tier starts over with a full bucket for its new tier.
#[derive(Debug)]
pub struct RateLimiter<K = PeerKey> {
    new: RateLimitParams,
    probation: RateLimitParams,
    trusted: RateLimitParams,
    buckets: HashMap<K, TokenBucket>,
    cost: u32,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    #[must_use]
    pub fn new(new: RateLimitParams, probation: RateLimitParams, trusted: RateLimitParams) -> Self {
        Self {
            new,
            probation,
            trusted,
            buckets: HashMap::new(),
            cost: 1,
        }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.new.params(),
            config.probation.params(),
            config.trusted.params(),
        )
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(
            RateLimitParams::unbounded(),
            RateLimitParams::unbounded(),
            RateLimitParams::unbounded(),
        )
    }

    fn params_for(&self, tier: TrustLevel) -> Option<RateLimitParams> {
        match tier {
            TrustLevel::New => Some(self.new),
            TrustLevel::Probation => Some(self.probation),
            TrustLevel::Trusted => Some(self.trusted),
            TrustLevel::Drop => None,
        }
    }

    /// Consumes one packet from `key`'s budget at `now` (milliseconds).
    pub fn try_acquire(&mut self, now: u64, key: &K, tier: TrustLevel) -> bool {
        let Some(params) = self.params_for(tier) else {
            return false;
        };
        if params.is_unbounded() {
            return true;
        }
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(tier, params));
        if bucket.tier != tier {
            *bucket = TokenBucket::new(tier, params);
        }
        bucket.try_consume(now, self.cost)
    }

    /// Forgets the bucket for `key`.
    pub fn remove(&mut self, key: &K) {
        self.buckets.remove(key);
    }

    /// Drops buckets that have refilled to capacity by `now`, returning how
    /// many were removed. Forgetting them is indistinguishable from keeping
    /// them, so this only bounds memory.
    pub fn evict_idle(&mut self, now: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle(now));
        before - self.buckets.len()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::unlimited()
    }
}
