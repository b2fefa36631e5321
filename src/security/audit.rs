// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use rand_core_06::{OsRng, RngCore};
use zeroize::Zeroizing;

#[cfg(test)]
use zeroize::Zeroize;

/// HMAC key used to sign capability tokens.
pub type TokenSecret = Zeroizing<Vec<u8>>;

/// Raw Ed25519 secret key bytes of the node identity.
pub type IdentitySecret = Zeroizing<Vec<u8>>;

/// Length of freshly generated token secrets.
pub const TOKEN_SECRET_LEN: usize = 32;

/// Human-readable labels used when auditing secret containers.
pub const SECRET_TYPE_NAMES: &[&str] = &[
    "TokenSecret (HMAC-SHA256 key for capability tokens)",
    "IdentitySecret (Ed25519 secret key of the node identity)",
];

/// Fresh random token secret from the OS generator.
#[must_use]
pub fn generate_token_secret() -> TokenSecret {
    let mut secret = Zeroizing::new(vec![0u8; TOKEN_SECRET_LEN]);
    OsRng.fill_bytes(&mut secret);
    secret
}
