// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Three-message signed challenge/response handshake.
//!
//! ```text
//! A (initiator)                              B (responder)
//!   initiate  ── SYN {n1, sig_A(n1), A} ──▶  respond   (replay, verify, promote A)
//!   complete  ◀─ SYN-ACK {n2, sig_B(n2, n1), B}
//!   (replay, verify, promote B)
//!             ── ACK {n2, sig_A(n2), A} ──▶  finalize  (echo + signature check)
//! ```
//!
//! Both sides claim an incoming nonce in the replay cache *before* checking its
//! signature, so a nonce seen once is burned whether or not it verified. Trust
//! only moves for the party whose signature was just verified, one step per
//! completed round. The responder's signature also covers `n1`, so a `SYN-ACK`
//! only ever completes the attempt it answered.

/// Per-source retry accounting and temporary blocking.
pub mod guard;
/// Wire records exchanged with the transport.
pub mod message;

use std::sync::Arc;

use rand_core_06::{OsRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::HandshakeConfig;
use crate::identity::{verify_signature, IdentityError, NodeIdentity, PeerKey, PUBLIC_KEY_LEN};
use crate::replay::ReplayCache;
use crate::trust::{PacketType, TrustLevel, TrustTable};

pub use guard::RetryGuard;
pub use message::{Challenge, HandshakeMessage};

use message::{signing_material, validate_nonce};

const NONCE_BYTES: usize = 32;

/// Errors that terminate a single handshake attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("replayed nonce")]
    Replay,
    #[error("challenge signature invalid")]
    SignatureInvalid,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("peer {0} is dropped")]
    PeerDropped(PeerKey),
    #[error("handshake with our own key rejected")]
    Reflected,
    #[error("source {origin} blocked until {until}")]
    Blocked { origin: String, until: u64 },
    #[error("handshake rate limit exceeded")]
    RateLimited,
    #[error("handshake timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("expected {expected} but received {received}")]
    UnexpectedMessage {
        expected: PacketType,
        received: PacketType,
    },
    #[error("attempt is not awaiting a message")]
    NotAwaiting,
    #[error("acknowledgement does not match the issued challenge")]
    AckMismatch,
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<IdentityError> for HandshakeError {
    fn from(value: IdentityError) -> Self {
        match value {
            IdentityError::SignatureInvalid => Self::SignatureInvalid,
            _ => Self::InvalidPublicKey,
        }
    }
}

/// Progress of one initiator-side attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    SynSent,
    SynAckReceived,
    AckSent,
    Complete,
    Failed,
}

/// Progress of one responder-side attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponderPhase {
    AwaitingAck,
    Complete,
    Failed,
}

/// Initiator bookkeeping for an attempt in flight.
#[derive(Clone, Debug)]
pub struct InitiatorState {
    nonce: String,
    started_at: u64,
    phase: HandshakePhase,
}

impl InitiatorState {
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    #[must_use]
    pub fn started_at(&self) -> u64 {
        self.started_at
    }
}

/// Responder bookkeeping between `SYN-ACK` and `ACK`.
#[derive(Clone, Debug)]
pub struct ResponderState {
    initiator: PeerKey,
    initiator_key: Vec<u8>,
    nonce: String,
    started_at: u64,
    phase: ResponderPhase,
}

impl ResponderState {
    #[must_use]
    pub fn initiator(&self) -> &PeerKey {
        &self.initiator
    }

    #[must_use]
    pub fn phase(&self) -> ResponderPhase {
        self.phase
    }
}

/// Authenticated peer and its trust level after the step that verified it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub peer: PeerKey,
    pub level: TrustLevel,
}

/// Runs both sides of the handshake against shared replay and trust state.
pub struct Handshaker {
    identity: Arc<NodeIdentity>,
    replay: Arc<dyn ReplayCache>,
    trust: Arc<TrustTable>,
    timeout_ms: u64,
}

impl Handshaker {
    pub fn new(
        identity: Arc<NodeIdentity>,
        replay: Arc<dyn ReplayCache>,
        trust: Arc<TrustTable>,
        config: &HandshakeConfig,
    ) -> Self {
        Self {
            identity,
            replay,
            trust,
            timeout_ms: config.timeout_ms,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Starts an attempt: fresh nonce `n1`, signed and wrapped in a `SYN`.
    pub fn initiate(&self, now: u64) -> (InitiatorState, HandshakeMessage) {
        let challenge = self.sign_fresh(PacketType::Syn, None);
        let state = InitiatorState {
            nonce: challenge.nonce.clone(),
            started_at: now,
            phase: HandshakePhase::SynSent,
        };
        (state, HandshakeMessage::Syn(challenge))
    }

    /// Handles an inbound `SYN`, promoting the initiator on success.
    pub fn respond(
        &self,
        message: &HandshakeMessage,
        now: u64,
    ) -> Result<(ResponderState, HandshakeMessage), HandshakeError> {
        let syn = expect(message, PacketType::Syn)?;
        let peer = self.verify_fresh(PacketType::Syn, syn, None, now)?;
        let level = self.trust.promote(&peer, now);
        debug!(target: "handshake", %peer, %level, "accepted SYN");

        let challenge = self.sign_fresh(PacketType::SynAck, Some(syn.nonce.as_str()));
        let state = ResponderState {
            initiator: peer,
            initiator_key: syn.public_key.clone(),
            nonce: challenge.nonce.clone(),
            started_at: now,
            phase: ResponderPhase::AwaitingAck,
        };
        Ok((state, HandshakeMessage::SynAck(challenge)))
    }

    /// Handles the responder's `SYN-ACK`, promoting the responder and
    /// producing the closing `ACK`.
    pub fn complete(
        &self,
        state: &mut InitiatorState,
        message: &HandshakeMessage,
        now: u64,
    ) -> Result<(HandshakeOutcome, HandshakeMessage), HandshakeError> {
        if state.phase != HandshakePhase::SynSent {
            return Err(HandshakeError::NotAwaiting);
        }
        let result = self.complete_inner(state, message, now);
        state.phase = match result {
            Ok(_) => HandshakePhase::AckSent,
            Err(_) => HandshakePhase::Failed,
        };
        result
    }

    fn complete_inner(
        &self,
        state: &mut InitiatorState,
        message: &HandshakeMessage,
        now: u64,
    ) -> Result<(HandshakeOutcome, HandshakeMessage), HandshakeError> {
        self.check_deadline(state.started_at, now)?;
        let syn_ack = expect(message, PacketType::SynAck)?;
        let peer = self.verify_fresh(PacketType::SynAck, syn_ack, Some(state.nonce.as_str()), now)?;
        state.phase = HandshakePhase::SynAckReceived;
        let level = self.trust.promote(&peer, now);
        debug!(target: "handshake", %peer, %level, "accepted SYN-ACK");

        let ack = Challenge {
            nonce: syn_ack.nonce.clone(),
            challenge: self
                .identity
                .sign(&signing_material(PacketType::Ack, &syn_ack.nonce, None)),
            public_key: self.identity.public_key_bytes().to_vec(),
        };
        Ok((HandshakeOutcome { peer, level }, HandshakeMessage::Ack(ack)))
    }

    /// Marks the initiator-side attempt finished once its `ACK` is on the wire.
    pub fn acknowledge_sent(&self, state: &mut InitiatorState) {
        if state.phase == HandshakePhase::AckSent {
            state.phase = HandshakePhase::Complete;
        }
    }

    /// Handles the initiator's `ACK`, closing the responder-side attempt.
    pub fn finalize(
        &self,
        state: &mut ResponderState,
        message: &HandshakeMessage,
        now: u64,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if state.phase != ResponderPhase::AwaitingAck {
            return Err(HandshakeError::NotAwaiting);
        }
        let result = self.finalize_inner(state, message, now);
        state.phase = match result {
            Ok(_) => ResponderPhase::Complete,
            Err(_) => ResponderPhase::Failed,
        };
        result
    }

    fn finalize_inner(
        &self,
        state: &ResponderState,
        message: &HandshakeMessage,
        now: u64,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        self.check_deadline(state.started_at, now)?;
        let ack = expect(message, PacketType::Ack)?;
        let nonce_matches = ack.nonce.as_bytes().ct_eq(state.nonce.as_bytes());
        let key_matches = ack.public_key.as_slice().ct_eq(&state.initiator_key);
        if !bool::from(nonce_matches & key_matches) {
            warn!(target: "handshake", peer = %state.initiator, "ACK does not match issued challenge");
            return Err(HandshakeError::AckMismatch);
        }
        verify_signature(
            &ack.public_key,
            &signing_material(PacketType::Ack, &ack.nonce, None),
            &ack.challenge,
        )
        .map_err(|error| {
            warn!(target: "handshake", peer = %state.initiator, "ACK signature rejected");
            HandshakeError::from(error)
        })?;
        Ok(HandshakeOutcome {
            peer: state.initiator.clone(),
            level: self.trust.level(&state.initiator),
        })
    }

    fn check_deadline(&self, started_at: u64, now: u64) -> Result<(), HandshakeError> {
        let elapsed_ms = now.saturating_sub(started_at);
        if elapsed_ms > self.timeout_ms {
            warn!(target: "handshake", elapsed_ms, "handshake attempt expired");
            return Err(HandshakeError::Timeout { elapsed_ms });
        }
        Ok(())
    }

    /// Shared checks for `SYN` and `SYN-ACK`: key shape, drop state, replay
    /// claim, then signature (over `answering` too, for a `SYN-ACK`). Never
    /// mutates trust.
    fn verify_fresh(
        &self,
        kind: PacketType,
        challenge: &Challenge,
        answering: Option<&str>,
        now: u64,
    ) -> Result<PeerKey, HandshakeError> {
        validate_nonce(&challenge.nonce)?;
        if challenge.public_key.len() != PUBLIC_KEY_LEN {
            return Err(HandshakeError::InvalidPublicKey);
        }
        let own_key = self.identity.public_key_bytes();
        if bool::from(challenge.public_key.as_slice().ct_eq(&own_key)) {
            return Err(HandshakeError::Reflected);
        }
        let peer = PeerKey::from_public_key(&challenge.public_key);
        if self.trust.level(&peer) == TrustLevel::Drop {
            warn!(target: "handshake", %peer, %kind, "refusing dropped peer");
            return Err(HandshakeError::PeerDropped(peer));
        }
        if self.replay.replay_seen_and_mark(&challenge.nonce, now) {
            warn!(target: "handshake", %peer, %kind, "replayed nonce rejected");
            return Err(HandshakeError::Replay);
        }
        verify_signature(
            &challenge.public_key,
            &signing_material(kind, &challenge.nonce, answering),
            &challenge.challenge,
        )
        .map_err(|error| {
            warn!(target: "handshake", %peer, %kind, "challenge signature rejected");
            HandshakeError::from(error)
        })?;
        Ok(peer)
    }

    fn sign_fresh(&self, kind: PacketType, answering: Option<&str>) -> Challenge {
        let nonce = fresh_nonce();
        Challenge {
            challenge: self.identity.sign(&signing_material(kind, &nonce, answering)),
            public_key: self.identity.public_key_bytes().to_vec(),
            nonce,
        }
    }
}

fn expect(message: &HandshakeMessage, expected: PacketType) -> Result<&Challenge, HandshakeError> {
    let received = message.packet_type();
    if received != expected {
        return Err(HandshakeError::UnexpectedMessage { expected, received });
    }
    Ok(message.challenge())
}

/// 256-bit random nonce, hex encoded.
#[must_use]
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandshakeConfig;
    use crate::replay::NonceCache;

    struct Node {
        handshaker: Handshaker,
        trust: Arc<TrustTable>,
        replay: Arc<NonceCache>,
        key: PeerKey,
    }

    fn node() -> Node {
        let identity = Arc::new(NodeIdentity::generate());
        let trust = Arc::new(TrustTable::new(10));
        let replay = Arc::new(NonceCache::default());
        let key = identity.peer_key();
        let replay_dyn: Arc<dyn ReplayCache> = replay.clone();
        Node {
            handshaker: Handshaker::new(
                identity,
                replay_dyn,
                Arc::clone(&trust),
                &HandshakeConfig::default(),
            ),
            trust,
            replay,
            key,
        }
    }

    fn run(a: &Node, b: &Node, now: u64) -> Result<(HandshakeOutcome, HandshakeOutcome), HandshakeError> {
        let (mut init, syn) = a.handshaker.initiate(now);
        let (mut resp, syn_ack) = b.handshaker.respond(&syn, now)?;
        let (a_view, ack) = a.handshaker.complete(&mut init, &syn_ack, now)?;
        a.handshaker.acknowledge_sent(&mut init);
        assert_eq!(init.phase(), HandshakePhase::Complete);
        let b_view = b.handshaker.finalize(&mut resp, &ack, now)?;
        assert_eq!(resp.phase(), ResponderPhase::Complete);
        Ok((a_view, b_view))
    }

    #[test]
    fn honest_parties_reach_probation() {
        let a = node();
        let b = node();
        let (a_view, b_view) = run(&a, &b, 1_000).unwrap();
        assert_eq!(a_view.peer, b.key);
        assert_eq!(b_view.peer, a.key);
        assert_eq!(a.trust.level(&b.key), TrustLevel::Probation);
        assert_eq!(b.trust.level(&a.key), TrustLevel::Probation);
        assert_eq!(a.replay.len(), 1);
        assert_eq!(b.replay.len(), 1);
    }

    #[test]
    fn repeated_rounds_count_toward_trust() {
        let a = node();
        let b = node();
        for round in 0..11 {
            run(&a, &b, round).unwrap();
        }
        assert_eq!(a.trust.level(&b.key), TrustLevel::Trusted);
        assert_eq!(b.trust.level(&a.key), TrustLevel::Trusted);
    }

    #[test]
    fn replayed_syn_is_rejected_even_with_valid_signature() {
        let a = node();
        let b = node();
        let (_, syn) = a.handshaker.initiate(0);
        b.handshaker.respond(&syn, 0).unwrap();
        assert_eq!(b.handshaker.respond(&syn, 1).unwrap_err(), HandshakeError::Replay);
        // The trust change from the first delivery stands; the replay adds nothing.
        assert_eq!(b.trust.record(&a.key).unwrap().total_successes, 1);
    }

    #[test]
    fn forged_syn_burns_nonce_without_touching_trust() {
        let a = node();
        let b = node();
        let (_, syn) = a.handshaker.initiate(0);
        let HandshakeMessage::Syn(mut forged) = syn.clone() else {
            unreachable!()
        };
        forged.challenge[0] ^= 0x01;
        let err = b
            .handshaker
            .respond(&HandshakeMessage::Syn(forged), 0)
            .unwrap_err();
        assert_eq!(err, HandshakeError::SignatureInvalid);
        assert!(b.trust.record(&a.key).is_none());
        // Resubmitting the genuine signature under the burned nonce fails.
        assert_eq!(b.handshaker.respond(&syn, 1).unwrap_err(), HandshakeError::Replay);
    }

    #[test]
    fn forged_syn_ack_aborts_without_trust_change() {
        let a = node();
        let b = node();
        let mallory = node();
        let (mut init, syn) = a.handshaker.initiate(0);
        let (_, syn_ack) = b.handshaker.respond(&syn, 0).unwrap();
        // Mallory claims B's key but signs with her own.
        let HandshakeMessage::SynAck(mut forged) = syn_ack else {
            unreachable!()
        };
        let (_, mallory_syn) = mallory.handshaker.initiate(0);
        forged.challenge = mallory_syn.challenge().challenge.clone();
        let err = a
            .handshaker
            .complete(&mut init, &HandshakeMessage::SynAck(forged), 1)
            .unwrap_err();
        assert_eq!(err, HandshakeError::SignatureInvalid);
        assert_eq!(init.phase(), HandshakePhase::Failed);
        assert!(a.trust.record(&b.key).is_none());
    }

    #[test]
    fn syn_ack_from_another_session_is_rejected() {
        let a = node();
        let b = node();
        let c = node();
        let (mut init, _) = a.handshaker.initiate(0);
        // B genuinely answers C, never A.
        let (mut c_init, c_syn) = c.handshaker.initiate(0);
        let (_, syn_ack_for_c) = b.handshaker.respond(&c_syn, 0).unwrap();
        let err = a
            .handshaker
            .complete(&mut init, &syn_ack_for_c, 1)
            .unwrap_err();
        assert_eq!(err, HandshakeError::SignatureInvalid);
        assert_eq!(init.phase(), HandshakePhase::Failed);
        assert!(a.trust.record(&b.key).is_none());

        // A's replay cache burned n2, but C never saw it and still completes.
        let (outcome, _) = c.handshaker.complete(&mut c_init, &syn_ack_for_c, 1).unwrap();
        assert_eq!(outcome.peer, b.key);
    }

    #[test]
    fn late_syn_ack_times_out() {
        let a = node();
        let b = node();
        let (mut init, syn) = a.handshaker.initiate(0);
        let (_, syn_ack) = b.handshaker.respond(&syn, 0).unwrap();
        let err = a.handshaker.complete(&mut init, &syn_ack, 10_001).unwrap_err();
        assert_eq!(err, HandshakeError::Timeout { elapsed_ms: 10_001 });
        assert!(a.trust.record(&b.key).is_none());
        assert_eq!(
            a.handshaker.complete(&mut init, &syn_ack, 10_002).unwrap_err(),
            HandshakeError::NotAwaiting
        );
    }

    #[test]
    fn ack_must_echo_responder_nonce() {
        let a = node();
        let b = node();
        let (mut init, syn) = a.handshaker.initiate(0);
        let (mut resp, syn_ack) = b.handshaker.respond(&syn, 0).unwrap();
        let (_, ack) = a.handshaker.complete(&mut init, &syn_ack, 0).unwrap();
        let HandshakeMessage::Ack(mut wrong) = ack else {
            unreachable!()
        };
        wrong.nonce = fresh_nonce();
        let err = b
            .handshaker
            .finalize(&mut resp, &HandshakeMessage::Ack(wrong), 1)
            .unwrap_err();
        assert_eq!(err, HandshakeError::AckMismatch);
        assert_eq!(resp.phase(), ResponderPhase::Failed);
    }

    #[test]
    fn dropped_and_reflected_peers_are_refused() {
        let a = node();
        let b = node();
        b.trust.drop_peer(&a.key, 0);
        let (_, syn) = a.handshaker.initiate(0);
        assert_eq!(
            b.handshaker.respond(&syn, 0).unwrap_err(),
            HandshakeError::PeerDropped(a.key.clone())
        );
        // A dropped peer's nonce is not consumed.
        assert!(b.replay.is_empty());

        let (_, own_syn) = b.handshaker.initiate(0);
        assert_eq!(b.handshaker.respond(&own_syn, 0).unwrap_err(), HandshakeError::Reflected);
    }

    #[test]
    fn wrong_message_kind_is_rejected() {
        let a = node();
        let b = node();
        let (mut init, syn) = a.handshaker.initiate(0);
        let err = a.handshaker.complete(&mut init, &syn, 0).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::UnexpectedMessage {
                expected: PacketType::SynAck,
                received: PacketType::Syn,
            }
        );
        let (_, syn_ack) = {
            let (_, syn) = a.handshaker.initiate(0);
            b.handshaker.respond(&syn, 0).unwrap()
        };
        assert!(matches!(
            b.handshaker.respond(&syn_ack, 0),
            Err(HandshakeError::UnexpectedMessage { .. })
        ));
    }
}
