// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use super::CapabilityScope;
use crate::security::audit::TokenSecret;

const TOKEN_DST: &[u8] = b"IPPOC_CAPABILITY_V1";

/// Shortest HMAC key accepted for signing tokens.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token signing secret is {len} bytes, need at least {min}")]
    WeakSecret { len: usize, min: usize },
    #[error("failed to encode token claims: {0}")]
    Encoding(String),
}

/// Unguessable token identifier (random UUIDv4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Uuid);

impl TokenId {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TokenId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Upper bounds on what an operation running under a token may consume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_millis: Option<u64>,
    pub max_network_bytes: Option<u64>,
}

/// Consumption reported by the caller when asking for a check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_millis: u64,
    pub network_bytes: u64,
}

/// First limit exceeded by a usage report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceViolation {
    pub resource: &'static str,
    pub used: u64,
    pub limit: u64,
}

impl ResourceLimits {
    pub fn check(&self, usage: &ResourceUsage) -> Result<(), ResourceViolation> {
        let pairs = [
            ("memory", usage.memory_bytes, self.max_memory_bytes),
            ("cpu", usage.cpu_millis, self.max_cpu_millis),
            ("network", usage.network_bytes, self.max_network_bytes),
        ];
        for (resource, used, limit) in pairs {
            if let Some(limit) = limit {
                if used > limit {
                    return Err(ResourceViolation {
                        resource,
                        used,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether every limit here is at least as strict as in `outer`.
    #[must_use]
    pub fn within(&self, outer: &Self) -> bool {
        fn narrower(inner: Option<u64>, outer: Option<u64>) -> bool {
            match (inner, outer) {
                (_, None) => true,
                (Some(inner), Some(outer)) => inner <= outer,
                (None, Some(_)) => false,
            }
        }
        narrower(self.max_memory_bytes, outer.max_memory_bytes)
            && narrower(self.max_cpu_millis, outer.max_cpu_millis)
            && narrower(self.max_network_bytes, outer.max_network_bytes)
    }
}

/// One entry in a token's audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: u64,
    pub action: String,
    pub resource: Option<String>,
    pub success: bool,
    /// Set when the scope check was skipped by the emergency bypass.
    pub emergency: bool,
    pub reason: Option<String>,
}

/// A scoped, time-bounded grant. Owned by the [`TokenManager`](super::TokenManager);
/// callers hold copies and refer to the live token by [`TokenId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub id: TokenId,
    pub scope: CapabilityScope,
    pub issued_by: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub path_constraint: Option<String>,
    pub domain_constraint: Option<String>,
    pub resource_limits: Option<ResourceLimits>,
    pub parent_token_id: Option<TokenId>,
    pub audit_trail: Vec<AuditRecord>,
    #[serde(with = "hex::serde")]
    pub signature: [u8; 32],
    #[serde(with = "hex::serde")]
    pub checksum: [u8; 32],
}

/// Immutable fields covered by both the signature and the checksum.
#[derive(Serialize)]
struct Claims<'a> {
    id: &'a TokenId,
    scope: CapabilityScope,
    issued_by: &'a str,
    issued_at: u64,
    expires_at: u64,
    path_constraint: Option<&'a str>,
    domain_constraint: Option<&'a str>,
    resource_limits: Option<&'a ResourceLimits>,
    parent_token_id: Option<&'a TokenId>,
}

impl CapabilityToken {
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Canonical CBOR encoding of the immutable claims.
    pub fn claims_bytes(&self) -> Result<Vec<u8>, TokenError> {
        let claims = Claims {
            id: &self.id,
            scope: self.scope,
            issued_by: &self.issued_by,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            path_constraint: self.path_constraint.as_deref(),
            domain_constraint: self.domain_constraint.as_deref(),
            resource_limits: self.resource_limits.as_ref(),
            parent_token_id: self.parent_token_id.as_ref(),
        };
        serde_cbor::to_vec(&claims).map_err(|error| TokenError::Encoding(error.to_string()))
    }
}

/// SHA-256 over the claims; catches accidental corruption without the key.
#[must_use]
pub fn checksum(claims: &[u8]) -> [u8; 32] {
    Sha256::digest(claims).into()
}

/// HMAC-SHA256 signer holding the gateway's token key.
pub struct TokenSigner {
    key: TokenSecret,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(key: TokenSecret) -> Result<Self, TokenError> {
        if key.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret {
                len: key.len(),
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self { key })
    }

    pub fn sign(&self, claims: &[u8]) -> Result<[u8; 32], TokenError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key).map_err(|_| {
            TokenError::WeakSecret {
                len: self.key.len(),
                min: MIN_SECRET_LEN,
            }
        })?;
        mac.update(TOKEN_DST);
        mac.update(claims);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Recomputes signature and checksum of `token` in constant time.
    #[must_use]
    pub fn authenticate(&self, token: &CapabilityToken) -> bool {
        let Ok(claims) = token.claims_bytes() else {
            return false;
        };
        let Ok(expected) = self.sign(&claims) else {
            return false;
        };
        let signature_ok = token.signature[..].ct_eq(&expected[..]);
        let checksum_ok = token.checksum[..].ct_eq(&checksum(&claims)[..]);
        bool::from(signature_ok & checksum_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn signer() -> TokenSigner {
        TokenSigner::new(Zeroizing::new(vec![7u8; 32])).unwrap()
    }

    fn token(signer: &TokenSigner) -> CapabilityToken {
        let mut token = CapabilityToken {
            id: TokenId::random(),
            scope: CapabilityScope::FsRead,
            issued_by: "node-a".to_string(),
            issued_at: 10,
            expires_at: 20,
            path_constraint: Some("/var/ippoc".to_string()),
            domain_constraint: None,
            resource_limits: None,
            parent_token_id: None,
            audit_trail: Vec::new(),
            signature: [0; 32],
            checksum: [0; 32],
        };
        let claims = token.claims_bytes().unwrap();
        token.signature = signer.sign(&claims).unwrap();
        token.checksum = checksum(&claims);
        token
    }

    #[test]
    fn edits_to_any_claim_break_authentication() {
        let signer = signer();
        let original = token(&signer);
        assert!(signer.authenticate(&original));

        let mut widened = original.clone();
        widened.scope = CapabilityScope::Admin;
        assert!(!signer.authenticate(&widened));

        let mut extended = original.clone();
        extended.expires_at += 1;
        assert!(!signer.authenticate(&extended));

        let mut unconstrained = original.clone();
        unconstrained.path_constraint = None;
        assert!(!signer.authenticate(&unconstrained));

        // The audit trail is mutable state and not covered.
        let mut audited = original;
        audited.audit_trail.push(AuditRecord {
            timestamp: 11,
            action: "read".to_string(),
            resource: None,
            success: true,
            emergency: false,
            reason: None,
        });
        assert!(signer.authenticate(&audited));
    }

    #[test]
    fn other_keys_do_not_authenticate() {
        let token = token(&signer());
        let other = TokenSigner::new(Zeroizing::new(vec![8u8; 32])).unwrap();
        assert!(!other.authenticate(&token));
    }

    #[test]
    fn short_secrets_are_refused() {
        assert_eq!(
            TokenSigner::new(Zeroizing::new(vec![1u8; 16])).unwrap_err(),
            TokenError::WeakSecret { len: 16, min: 32 }
        );
    }

    #[test]
    fn resource_limits_report_first_violation() {
        let limits = ResourceLimits {
            max_memory_bytes: Some(1024),
            max_cpu_millis: None,
            max_network_bytes: Some(10),
        };
        let usage = ResourceUsage {
            memory_bytes: 512,
            cpu_millis: 1_000_000,
            network_bytes: 11,
        };
        let violation = limits.check(&usage).unwrap_err();
        assert_eq!(violation.resource, "network");
        assert_eq!(violation.limit, 10);

        let tighter = ResourceLimits {
            max_memory_bytes: Some(512),
            max_cpu_millis: Some(5),
            max_network_bytes: Some(10),
        };
        assert!(tighter.within(&limits));
        assert!(!limits.within(&tighter));
    }

    #[test]
    fn token_ids_round_trip_through_text() {
        let id = TokenId::random();
        assert_eq!(id.to_string().parse::<TokenId>().unwrap(), id);
        assert!("not-a-uuid".parse::<TokenId>().is_err());
    }
}
