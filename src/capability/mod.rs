// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Scoped, time-bounded permits gating privileged operations.
//!
//! Tokens are issued and owned by a [`TokenManager`]; callers refer to them by
//! [`TokenId`] and ask [`TokenManager::verify`] before running anything
//! privileged. Verification never fails with an error: it returns a
//! [`Verdict`] whose denial carries a stable reason string.

/// Issuance, verification and revocation.
pub mod manager;
/// Scope lattice.
pub mod scope;
/// Token record, claims encoding and signing.
pub mod token;

pub use manager::{Denial, IssueError, IssueRequest, TokenManager, Verdict, VerifyContext};
pub use scope::{CapabilityScope, ScopeParseError};
pub use token::{
    AuditRecord, CapabilityToken, ResourceLimits, ResourceUsage, TokenError, TokenId, TokenSigner,
};
