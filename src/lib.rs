#![forbid(unsafe_code)]

//! Trust-gated capability gateway for autonomous peer nodes.
//!
//! A [`Gateway`] answers three questions about any request: is the remote peer
//! who it claims to be ([`handshake`]), how much has it earned ([`trust`]), and
//! may this operation run right now ([`capability`]).

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Capability token issuance, verification, and revocation.
pub mod capability;
/// On-disk gateway configuration.
pub mod config;
/// Gateway context and async handshake drivers.
pub mod gateway;
/// Signed challenge/response handshake between peers.
pub mod handshake;
/// Node signing keys and stable peer keys.
pub mod identity;
/// Transport links and rate limiting.
pub mod net;
/// Replay-protected nonce cache.
pub mod replay;
/// Secrets handling and audit helpers.
pub mod security;
/// Per-peer trust state machine.
pub mod trust;

pub use capability::{
    CapabilityScope, CapabilityToken, Denial, IssueError, IssueRequest, TokenId, TokenManager,
    Verdict, VerifyContext,
};
pub use config::{ConfigError, GatewayConfig};
pub use gateway::{Admission, DropReason, Gateway, GatewayError, Housekeeping};
pub use handshake::{HandshakeError, HandshakeMessage, HandshakeOutcome, Handshaker};
pub use identity::{IdentityError, NodeIdentity, PeerKey};
pub use replay::{NonceCache, ReplayCache};
pub use trust::{should_drop_packet, PacketType, TrustLevel, TrustTable};

/// Current wall-clock time in Unix milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Locks `mutex`, recovering the data if a previous holder panicked. Every
/// critical section in this crate leaves its table consistent before any
/// point that could panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_past_2023() {
        assert!(unix_millis() > 1_672_531_200_000);
    }

    #[test]
    fn poisoned_locks_are_recovered() {
        let mutex = std::sync::Arc::new(Mutex::new(1u32));
        let poisoner = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
