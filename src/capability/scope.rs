// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Privileged operation classes a capability token can grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityScope {
    FsRead,
    FsWrite,
    ProcessExec,
    WasmExec,
    Network,
    MemoryManage,
    NodeLocal,
    CrossNode,
    Admin,
    Security,
    Emergency,
    Temporary,
    Maintenance,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown capability scope {0:?}")]
pub struct ScopeParseError(pub String);

impl CapabilityScope {
    pub const ALL: [Self; 13] = [
        Self::FsRead,
        Self::FsWrite,
        Self::ProcessExec,
        Self::WasmExec,
        Self::Network,
        Self::MemoryManage,
        Self::NodeLocal,
        Self::CrossNode,
        Self::Admin,
        Self::Security,
        Self::Emergency,
        Self::Temporary,
        Self::Maintenance,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FsRead => "FS_READ",
            Self::FsWrite => "FS_WRITE",
            Self::ProcessExec => "PROCESS_EXEC",
            Self::WasmExec => "WASM_EXEC",
            Self::Network => "NETWORK",
            Self::MemoryManage => "MEMORY_MANAGE",
            Self::NodeLocal => "NODE_LOCAL",
            Self::CrossNode => "CROSS_NODE",
            Self::Admin => "ADMIN",
            Self::Security => "SECURITY",
            Self::Emergency => "EMERGENCY",
            Self::Temporary => "TEMPORARY",
            Self::Maintenance => "MAINTENANCE",
        }
    }

    /// Concrete scopes an umbrella scope grants besides itself.
    #[must_use]
    pub const fn covered_scopes(self) -> &'static [Self] {
        match self {
            Self::NodeLocal => &[Self::FsRead, Self::FsWrite, Self::ProcessExec, Self::WasmExec],
            Self::CrossNode => &[Self::Network, Self::MemoryManage],
            _ => &[],
        }
    }

    /// Scope lattice: `ADMIN` and `SECURITY` grant everything, umbrellas grant
    /// their covered scopes, everything else grants only itself.
    ///
    /// The emergency bypass is not part of the lattice; it is applied by the
    /// token manager where it can be audited.
    #[must_use]
    pub fn authorizes(self, required: Self) -> bool {
        matches!(self, Self::Admin | Self::Security)
            || self == required
            || self.covered_scopes().contains(&required)
    }

    /// Scopes whose tokens are consumed by their first successful check.
    #[must_use]
    pub const fn is_single_use(self) -> bool {
        matches!(
            self,
            Self::Temporary | Self::Emergency | Self::Maintenance | Self::WasmExec
        )
    }

    #[must_use]
    pub const fn bypasses_scope_check(self) -> bool {
        matches!(self, Self::Emergency)
    }
}

impl fmt::Display for CapabilityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CapabilityScope {
    type Err = ScopeParseError;

    /// Accepts the canonical names case-insensitively, with `-` or `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let canonical = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == canonical)
            .ok_or_else(|| ScopeParseError(s.to_string()))
    }
}
