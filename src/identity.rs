// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use libp2p_identity::ed25519;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::security::audit::IdentitySecret;

/// Length in bytes of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length in bytes of an Ed25519 secret key.
pub const SECRET_KEY_LEN: usize = 32;

/// Errors raised while decoding or verifying peer identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid secret key encoding")]
    InvalidSecretKey,
    #[error("invalid peer key {0:?}")]
    InvalidPeerKey(String),
    #[error("signature rejected")]
    SignatureInvalid,
}

/// Stable address of a peer, derived from its public key as lowercase hex.
///
/// Hex encoding is injective, so two distinct public keys can never map to the
/// same [`PeerKey`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerKey(String);

impl PeerKey {
    /// Derives the peer key for raw public key bytes.
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(hex::encode(public_key))
    }

    /// Parses a textual peer key, accepting only a hex encoded Ed25519 key.
    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        let valid = text.len() == PUBLIC_KEY_LEN * 2
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(IdentityError::InvalidPeerKey(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the public key bytes this peer key was derived from.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        hex::decode(&self.0).map_err(|_| IdentityError::InvalidPeerKey(self.0.clone()))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerKey {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerKey> for String {
    fn from(value: PeerKey) -> Self {
        value.0
    }
}

/// Signing keypair held by the local node.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: ed25519::Keypair,
}

impl NodeIdentity {
    /// Generates a fresh Ed25519 keypair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            keypair: ed25519::Keypair::generate(),
        }
    }

    /// Rebuilds an identity from its 32-byte secret key.
    pub fn from_secret_bytes(mut secret: IdentitySecret) -> Result<Self, IdentityError> {
        if secret.len() != SECRET_KEY_LEN {
            return Err(IdentityError::InvalidSecretKey);
        }
        let secret = ed25519::SecretKey::try_from_bytes(secret.as_mut_slice())
            .map_err(|_| IdentityError::InvalidSecretKey)?;
        Ok(Self {
            keypair: ed25519::Keypair::from(secret),
        })
    }

    /// Returns a copy of the secret key bytes that is wiped on drop.
    #[must_use]
    pub fn secret_bytes(&self) -> IdentitySecret {
        Zeroizing::new(self.keypair.secret().as_ref().to_vec())
    }

    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.keypair.public().to_bytes()
    }

    #[must_use]
    pub fn peer_key(&self) -> PeerKey {
        PeerKey::from_public_key(&self.public_key_bytes())
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_key", &self.peer_key())
            .finish_non_exhaustive()
    }
}

/// Verifies `signature` over `message` under a raw Ed25519 public key.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    if public_key.len() != PUBLIC_KEY_LEN {
        return Err(IdentityError::InvalidPublicKey);
    }
    let key = ed25519::PublicKey::try_from_bytes(public_key)
        .map_err(|_| IdentityError::InvalidPublicKey)?;
    if key.verify(message, signature) {
        Ok(())
    } else {
        Err(IdentityError::SignatureInvalid)
    }
}
