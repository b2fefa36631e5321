// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};

use super::HandshakeError;
use crate::net::MAX_FRAME_SIZE;
use crate::trust::PacketType;

/// Shortest nonce accepted from the wire.
pub const MIN_NONCE_LEN: usize = 16;
/// Longest nonce accepted from the wire.
pub const MAX_NONCE_LEN: usize = 128;

/// Domain separation tag prefixed to every signed challenge.
pub(crate) const CHALLENGE_DST: &[u8] = b"IPPOC_HANDSHAKE_V1";

/// Nonce, signature over it, and the signer's raw public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub nonce: String,
    #[serde(with = "hex::serde")]
    pub challenge: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
}

/// The three handshake records exchanged with the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    #[serde(rename = "SYN")]
    Syn(Challenge),
    #[serde(rename = "SYN-ACK")]
    SynAck(Challenge),
    /// Initiator's signature over the responder's nonce.
    #[serde(rename = "ACK")]
    Ack(Challenge),
}

impl HandshakeMessage {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Syn(_) => PacketType::Syn,
            Self::SynAck(_) => PacketType::SynAck,
            Self::Ack(_) => PacketType::Ack,
        }
    }

    #[must_use]
    pub fn challenge(&self) -> &Challenge {
        match self {
            Self::Syn(c) | Self::SynAck(c) | Self::Ack(c) => c,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        serde_json::to_vec(self).map_err(|error| HandshakeError::Malformed(error.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(HandshakeError::Malformed(format!(
                "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
                bytes.len()
            )));
        }
        let message: Self = serde_json::from_slice(bytes)
            .map_err(|error| HandshakeError::Malformed(error.to_string()))?;
        validate_nonce(&message.challenge().nonce)?;
        Ok(message)
    }
}

pub(crate) fn validate_nonce(nonce: &str) -> Result<(), HandshakeError> {
    if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&nonce.len()) {
        return Err(HandshakeError::Malformed(format!(
            "nonce length {} outside {MIN_NONCE_LEN}..={MAX_NONCE_LEN}",
            nonce.len()
        )));
    }
    if !nonce.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(HandshakeError::Malformed(
            "nonce contains non-printable bytes".to_string(),
        ));
    }
    Ok(())
}

/// Bytes covered by a challenge signature for `kind` over `nonce`, followed by
/// the nonce being answered when there is one. Validated nonces are printable
/// ASCII, so the `0x00` separator cannot be forged from nonce bytes.
pub(crate) fn signing_material(kind: PacketType, nonce: &str, answering: Option<&str>) -> Vec<u8> {
    let tag = match kind {
        PacketType::Syn => 0x01,
        PacketType::SynAck => 0x02,
        PacketType::Ack => 0x03,
        PacketType::Heartbeat | PacketType::Query | PacketType::Data => 0xff,
    };
    let answered = answering.unwrap_or_default();
    let mut material =
        Vec::with_capacity(CHALLENGE_DST.len() + 2 + nonce.len() + answered.len());
    material.extend_from_slice(CHALLENGE_DST);
    material.push(tag);
    material.extend_from_slice(nonce.as_bytes());
    if let Some(answered) = answering {
        material.push(0x00);
        material.extend_from_slice(answered.as_bytes());
    }
    material
}
