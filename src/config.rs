// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::ratelimit::{RateLimitParams, RateLimiter};

/// Errors produced while loading or validating a [`GatewayConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Replay cache retention settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Retention window for seen nonces, in milliseconds.
    pub ttl_ms: u64,
    /// Table size above which expired entries are swept.
    pub high_water: usize,
}

impl ReplayConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            high_water: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustConfig {
    /// Successful interactions on probation before a peer becomes trusted.
    pub promotion_threshold: u32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 10,
        }
    }
}

/// Handshake timing and abuse controls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeConfig {
    /// How long an attempt may wait for the next message.
    pub timeout_ms: u64,
    /// Attempts allowed before giving up (initiator) or blocking (responder).
    pub max_retries: u32,
    /// How long a peer stays blocked after exhausting its retries.
    pub block_ms: u64,
}

impl HandshakeConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            block_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilityConfig {
    /// Longest lifetime a capability token may be issued with.
    pub max_ttl_ms: u64,
    /// Audit records retained per token; older records are discarded first.
    pub max_audit_records: usize,
}

impl CapabilityConfig {
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        Duration::from_millis(self.max_ttl_ms)
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            max_ttl_ms: 24 * 60 * 60 * 1000,
            max_audit_records: 256,
        }
    }
}

/// Token bucket settings for one trust tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimit {
    pub capacity: u32,
    pub replenish: u32,
    pub interval_ms: u64,
}

impl TierLimit {
    #[must_use]
    pub const fn per_second(packets: u32) -> Self {
        Self {
            capacity: packets,
            replenish: packets,
            interval_ms: 1000,
        }
    }

    #[must_use]
    pub const fn params(&self) -> RateLimitParams {
        RateLimitParams::new(self.capacity, self.replenish, self.interval_ms)
    }
}

/// Per-tier packet admission rates. `DROP` peers are never admitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub new: TierLimit,
    pub probation: TierLimit,
    pub trusted: TierLimit,
    /// Inbound `SYN`s per transport source, charged before any signature check.
    pub handshake: TierLimit,
}

impl RateLimitConfig {
    /// Limiter for unverified `SYN`s: one budget per source, whatever key it claims.
    #[must_use]
    pub fn handshake_limiter(&self) -> RateLimiter<String> {
        let params = self.handshake.params();
        RateLimiter::new(params, params, params)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            new: TierLimit::per_second(5),
            probation: TierLimit::per_second(50),
            trusted: TierLimit::per_second(1000),
            handshake: TierLimit::per_second(50),
        }
    }
}

/// Complete runtime configuration for a [`Gateway`](crate::gateway::Gateway).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub replay: ReplayConfig,
    pub trust: TrustConfig,
    pub handshake: HandshakeConfig,
    pub capability: CapabilityConfig,
    pub rate_limits: RateLimitConfig,
}

impl GatewayConfig {
    /// Loads a JSON config, falling back to defaults when the file is absent.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = match fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|error| write_err(io::Error::other(error)))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.replay.ttl_ms == 0 {
            return invalid("replay.ttl_ms", "must be positive");
        }
        if self.replay.high_water == 0 {
            return invalid("replay.high_water", "must be positive");
        }
        if self.trust.promotion_threshold == 0 {
            return invalid("trust.promotion_threshold", "must be positive");
        }
        if self.handshake.timeout_ms == 0 {
            return invalid("handshake.timeout_ms", "must be positive");
        }
        if self.handshake.max_retries == 0 {
            return invalid("handshake.max_retries", "must allow at least one attempt");
        }
        if self.handshake.block_ms == 0 {
            return invalid("handshake.block_ms", "must be positive");
        }
        if self.capability.max_ttl_ms == 0 {
            return invalid("capability.max_ttl_ms", "must be positive");
        }
        for (field, tier) in [
            ("rate_limits.new", &self.rate_limits.new),
            ("rate_limits.probation", &self.rate_limits.probation),
            ("rate_limits.trusted", &self.rate_limits.trusted),
            ("rate_limits.handshake", &self.rate_limits.handshake),
        ] {
            if tier.capacity == 0 {
                return invalid(field, "capacity must be positive");
            }
        }
        Ok(())
    }
}
