// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Per-peer trust levels driven by handshake outcomes and interaction history.
//!
//! Peers climb `NEW -> PROBATION -> TRUSTED` one step at a time and fall back to
//! `NEW` on any recorded failure. `DROP` is only entered by an explicit operator
//! or policy decision through [`TrustTable::drop_peer`].

/// Persistence hook for trust records.
pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TrustConfig;
use crate::identity::PeerKey;
use crate::lock;

pub use store::{JsonTrustStore, TrustEntry, TrustStore, TrustStoreError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    #[default]
    New,
    Probation,
    Trusted,
    Drop,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "NEW",
            Self::Probation => "PROBATION",
            Self::Trusted => "TRUSTED",
            Self::Drop => "DROP",
        })
    }
}

/// Kinds of inbound packets subject to trust-based admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum PacketType {
    Syn,
    SynAck,
    Ack,
    Heartbeat,
    Query,
    Data,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Syn => "SYN",
            Self::SynAck => "SYN-ACK",
            Self::Ack => "ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::Query => "QUERY",
            Self::Data => "DATA",
        })
    }
}

/// First-line packet filter: whether a peer at `level` may not send `packet`.
///
/// Pure and allocation free; safe to call before any cryptographic work.
#[must_use]
pub const fn should_drop_packet(level: TrustLevel, packet: PacketType) -> bool {
    match level {
        TrustLevel::New => !matches!(packet, PacketType::Syn),
        TrustLevel::Probation => !matches!(
            packet,
            PacketType::SynAck | PacketType::Heartbeat | PacketType::Query
        ),
        TrustLevel::Trusted => false,
        TrustLevel::Drop => true,
    }
}

/// Trust state tracked for one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub level: TrustLevel,
    /// Successes counted toward promotion; only meaningful on `PROBATION`.
    pub success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_updated: u64,
}

impl TrustRecord {
    fn promote(&mut self, threshold: u32, now: u64) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.last_updated = now;
        match self.level {
            TrustLevel::New => {
                self.level = TrustLevel::Probation;
                self.success_count = 0;
            }
            TrustLevel::Probation => {
                self.success_count = self.success_count.saturating_add(1);
                if self.success_count >= threshold {
                    self.level = TrustLevel::Trusted;
                    self.success_count = 0;
                }
            }
            TrustLevel::Trusted | TrustLevel::Drop => {}
        }
    }

    fn fail(&mut self, now: u64) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.last_updated = now;
        if self.level != TrustLevel::Drop {
            self.level = TrustLevel::New;
            self.success_count = 0;
        }
    }
}

/// Shared table of trust records keyed by [`PeerKey`].
///
/// Every read-modify-write runs under one lock, so concurrent completions for
/// the same peer are serialized and no increment is lost.
#[derive(Debug)]
pub struct TrustTable {
    records: Mutex<HashMap<PeerKey, TrustRecord>>,
    promotion_threshold: u32,
}

impl TrustTable {
    #[must_use]
    pub fn new(promotion_threshold: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            promotion_threshold: promotion_threshold.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &TrustConfig) -> Self {
        Self::new(config.promotion_threshold)
    }

    #[must_use]
    pub fn promotion_threshold(&self) -> u32 {
        self.promotion_threshold
    }

    /// Current level; peers never observed are `NEW`.
    #[must_use]
    pub fn level(&self, peer: &PeerKey) -> TrustLevel {
        lock(&self.records)
            .get(peer)
            .map(|record| record.level)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn record(&self, peer: &PeerKey) -> Option<TrustRecord> {
        lock(&self.records).get(peer).cloned()
    }

    /// Records one successful interaction and returns the resulting level.
    pub fn promote(&self, peer: &PeerKey, now: u64) -> TrustLevel {
        let mut records = lock(&self.records);
        let record = records.entry(peer.clone()).or_default();
        let before = record.level;
        record.promote(self.promotion_threshold, now);
        if record.level != before {
            info!(target: "trust", %peer, from = %before, to = %record.level, "peer promoted");
        }
        record.level
    }

    /// Records an interaction outcome; any failure demotes to `NEW`.
    pub fn interact(&self, peer: &PeerKey, success: bool, now: u64) -> TrustLevel {
        if success {
            return self.promote(peer, now);
        }
        let mut records = lock(&self.records);
        let record = records.entry(peer.clone()).or_default();
        let before = record.level;
        record.fail(now);
        if before != record.level {
            warn!(target: "trust", %peer, from = %before, "peer demoted after failure");
        }
        record.level
    }

    /// Moves `peer` to `DROP`; only [`reinstate`](Self::reinstate) leaves it.
    pub fn drop_peer(&self, peer: &PeerKey, now: u64) {
        let mut records = lock(&self.records);
        let record = records.entry(peer.clone()).or_default();
        record.level = TrustLevel::Drop;
        record.success_count = 0;
        record.last_updated = now;
        warn!(target: "trust", %peer, "peer dropped");
    }

    /// Returns a dropped peer to `NEW`. Returns false if it was not dropped.
    pub fn reinstate(&self, peer: &PeerKey, now: u64) -> bool {
        let mut records = lock(&self.records);
        match records.get_mut(peer) {
            Some(record) if record.level == TrustLevel::Drop => {
                record.level = TrustLevel::New;
                record.success_count = 0;
                record.last_updated = now;
                info!(target: "trust", %peer, "peer reinstated");
                true
            }
            _ => false,
        }
    }

    /// Removes all state for `peer`.
    pub fn forget(&self, peer: &PeerKey) -> bool {
        lock(&self.records).remove(peer).is_some()
    }

    #[must_use]
    pub fn should_drop_packet(&self, peer: &PeerKey, packet: PacketType) -> bool {
        should_drop_packet(self.level(peer), packet)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every record, ordered by peer key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrustEntry> {
        let mut entries: Vec<TrustEntry> = lock(&self.records)
            .iter()
            .map(|(peer, record)| TrustEntry {
                peer: peer.clone(),
                record: record.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.peer.cmp(&b.peer));
        entries
    }

    /// Replaces the table contents with `entries`.
    pub fn restore(&self, entries: Vec<TrustEntry>) {
        let mut records = lock(&self.records);
        records.clear();
        records.extend(entries.into_iter().map(|entry| (entry.peer, entry.record)));
    }

    pub fn load_from(&self, store: &dyn TrustStore) -> Result<usize, TrustStoreError> {
        let entries = store.load()?;
        let count = entries.len();
        self.restore(entries);
        Ok(count)
    }

    pub fn save_to(&self, store: &dyn TrustStore) -> Result<(), TrustStoreError> {
        store.save(&self.snapshot())
    }
}

impl Default for TrustTable {
    fn default() -> Self {
        Self::from_config(&TrustConfig::default())
    }
}
