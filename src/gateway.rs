// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Constructed-once context tying identity, replay protection, trust and
//! capability tokens together, plus async drivers running the handshake over
//! a [`Link`].

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::capability::{TokenError, TokenManager};
use crate::config::{ConfigError, GatewayConfig};
use crate::handshake::{HandshakeError, HandshakeMessage, HandshakeOutcome, Handshaker, RetryGuard};
use crate::identity::{NodeIdentity, PeerKey, PUBLIC_KEY_LEN};
use crate::net::{Link, LinkError, RateLimiter};
use crate::replay::{NonceCache, ReplayCache};
use crate::security::audit::TokenSecret;
use crate::trust::{should_drop_packet, PacketType, TrustLevel, TrustStore, TrustStoreError, TrustTable};
use crate::{lock, unix_millis};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

impl From<LinkError> for HandshakeError {
    fn from(value: LinkError) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Why [`Gateway::admit_packet`] refused a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Filtered { level: TrustLevel, packet: PacketType },
    RateLimited { level: TrustLevel },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filtered { level, packet } => write!(f, "{level} peers may not send {packet}"),
            Self::RateLimited { level } => write!(f, "rate limit for {level} peers exceeded"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Drop(DropReason),
}

/// What one [`Gateway::maintain`] pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub nonces: usize,
    pub tokens: usize,
    pub rate_buckets: usize,
    pub sources: usize,
}

/// Everything one node needs to authenticate peers and gate privileged work.
pub struct Gateway {
    config: GatewayConfig,
    identity: Arc<NodeIdentity>,
    replay: Arc<NonceCache>,
    trust: Arc<TrustTable>,
    handshaker: Handshaker,
    guard: RetryGuard,
    limiter: Mutex<RateLimiter>,
    syn_limiter: Mutex<RateLimiter<String>>,
    tokens: TokenManager,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("peer_key", &self.identity.peer_key())
            .field("trusted_peers", &self.trust.len())
            .field("active_tokens", &self.tokens.active_count())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        identity: NodeIdentity,
        token_secret: TokenSecret,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let identity = Arc::new(identity);
        let replay = Arc::new(NonceCache::from_config(&config.replay));
        let trust = Arc::new(TrustTable::from_config(&config.trust));
        let replay_dyn: Arc<dyn ReplayCache> = replay.clone();
        let handshaker = Handshaker::new(
            Arc::clone(&identity),
            replay_dyn,
            Arc::clone(&trust),
            &config.handshake,
        );
        let guard = RetryGuard::from_config(&config.handshake);
        let limiter = Mutex::new(RateLimiter::from_config(&config.rate_limits));
        let syn_limiter = Mutex::new(config.rate_limits.handshake_limiter());
        let tokens = TokenManager::new(token_secret, &config.capability)?;
        info!(target: "gateway", peer_key = %identity.peer_key(), "gateway ready");
        Ok(Self {
            config,
            identity,
            replay,
            trust,
            handshaker,
            guard,
            limiter,
            syn_limiter,
            tokens,
        })
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    #[must_use]
    pub fn peer_key(&self) -> PeerKey {
        self.identity.peer_key()
    }

    #[must_use]
    pub fn trust(&self) -> &TrustTable {
        &self.trust
    }

    #[must_use]
    pub fn replay(&self) -> &NonceCache {
        &self.replay
    }

    #[must_use]
    pub fn handshaker(&self) -> &Handshaker {
        &self.handshaker
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// First-line admission for inbound traffic: trust filter, then the
    /// peer's tiered rate limit.
    pub fn admit_packet(&self, peer: &PeerKey, packet: PacketType, now: u64) -> Admission {
        let level = self.trust.level(peer);
        if should_drop_packet(level, packet) {
            debug!(target: "gateway", %peer, %level, %packet, "packet filtered");
            return Admission::Drop(DropReason::Filtered { level, packet });
        }
        if !lock(&self.limiter).try_acquire(now, peer, level) {
            debug!(target: "gateway", %peer, %level, "packet rate limited");
            return Admission::Drop(DropReason::RateLimited { level });
        }
        Admission::Admit
    }

    /// Runs the initiator side over `link`, retrying timed-out attempts with a
    /// fresh nonce up to `max_retries` times.
    pub async fn connect(&self, link: &dyn Link) -> Result<HandshakeOutcome, HandshakeError> {
        let source = link.remote_addr();
        self.ensure_not_blocked(source)?;
        let settings = &self.config.handshake;
        let mut attempts = 0;
        while attempts < settings.max_retries {
            attempts += 1;
            let error = match time::timeout(settings.timeout(), self.connect_once(link)).await {
                Ok(Ok(outcome)) => {
                    self.guard.record_success(source);
                    info!(target: "gateway", peer = %outcome.peer, level = %outcome.level, "outbound handshake complete");
                    return Ok(outcome);
                }
                Ok(Err(error)) => error,
                Err(_) => HandshakeError::Timeout {
                    elapsed_ms: settings.timeout_ms,
                },
            };
            warn!(target: "gateway", %source, attempt = attempts, %error, "outbound handshake failed");
            let blocked = self.guard.record_failure(source, unix_millis());
            if !matches!(error, HandshakeError::Timeout { .. }) {
                return Err(error);
            }
            if blocked.is_some() {
                break;
            }
        }
        Err(HandshakeError::RetriesExhausted { attempts })
    }

    async fn connect_once(&self, link: &dyn Link) -> Result<HandshakeOutcome, HandshakeError> {
        let (mut state, syn) = self.handshaker.initiate(unix_millis());
        link.send(syn.to_bytes()?).await?;
        let reply = HandshakeMessage::from_bytes(&link.recv().await?)?;
        let (outcome, ack) = self.handshaker.complete(&mut state, &reply, unix_millis())?;
        link.send(ack.to_bytes()?).await?;
        self.handshaker.acknowledge_sent(&mut state);
        Ok(outcome)
    }

    /// Runs the responder side over `link`: waits for a `SYN`, answers it and
    /// waits at most the handshake timeout for the closing `ACK`.
    ///
    /// The initiator is promoted as soon as its `SYN` verifies. An `ACK` that
    /// never arrives fails the attempt and counts against the source but does
    /// not undo that promotion.
    pub async fn accept(&self, link: &dyn Link) -> Result<HandshakeOutcome, HandshakeError> {
        let source = link.remote_addr();
        self.ensure_not_blocked(source)?;
        match self.accept_once(link, source).await {
            Ok(outcome) => {
                self.guard.record_success(source);
                info!(target: "gateway", peer = %outcome.peer, level = %outcome.level, "inbound handshake complete");
                Ok(outcome)
            }
            Err(error) => {
                warn!(target: "gateway", %source, %error, "inbound handshake failed");
                self.guard.record_failure(source, unix_millis());
                Err(error)
            }
        }
    }

    async fn accept_once(
        &self,
        link: &dyn Link,
        source: &str,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let syn = HandshakeMessage::from_bytes(&link.recv().await?)?;
        let public_key = &syn.challenge().public_key;
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(HandshakeError::InvalidPublicKey);
        }
        let claimed = PeerKey::from_public_key(public_key);
        if self.trust.level(&claimed) == TrustLevel::Drop {
            return Err(HandshakeError::PeerDropped(claimed));
        }
        // The claimed key is unproven here, so the budget belongs to the source.
        let admitted =
            lock(&self.syn_limiter).try_acquire(unix_millis(), &source.to_string(), TrustLevel::New);
        if !admitted {
            return Err(HandshakeError::RateLimited);
        }
        let (mut state, syn_ack) = self.handshaker.respond(&syn, unix_millis())?;
        link.send(syn_ack.to_bytes()?).await?;
        let settings = &self.config.handshake;
        let frame = time::timeout(settings.timeout(), link.recv())
            .await
            .map_err(|_| HandshakeError::Timeout {
                elapsed_ms: settings.timeout_ms,
            })??;
        let ack = HandshakeMessage::from_bytes(&frame)?;
        self.handshaker.finalize(&mut state, &ack, unix_millis())
    }

    fn ensure_not_blocked(&self, source: &str) -> Result<(), HandshakeError> {
        match self.guard.blocked_until(source, unix_millis()) {
            Some(until) => Err(HandshakeError::Blocked {
                origin: source.to_string(),
                until,
            }),
            None => Ok(()),
        }
    }

    /// Periodic housekeeping: expired nonces and tokens, refilled rate-limit
    /// buckets and stale retry state.
    pub fn maintain(&self, now: u64) -> Housekeeping {
        let rate_buckets =
            lock(&self.limiter).evict_idle(now) + lock(&self.syn_limiter).evict_idle(now);
        let report = Housekeeping {
            nonces: self.replay.purge(now),
            tokens: self.tokens.purge_expired(now),
            rate_buckets,
            sources: self.guard.purge(now),
        };
        debug!(target: "gateway", ?report, "maintenance pass");
        report
    }

    pub fn restore_trust(&self, store: &dyn TrustStore) -> Result<usize, TrustStoreError> {
        let count = self.trust.load_from(store)?;
        info!(target: "gateway", count, "trust records restored");
        Ok(count)
    }

    pub fn persist_trust(&self, store: &dyn TrustStore) -> Result<(), TrustStoreError> {
        self.trust.save_to(store)
    }
}
