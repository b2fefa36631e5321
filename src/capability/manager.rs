// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::token::{
    checksum, AuditRecord, CapabilityToken, ResourceLimits, ResourceUsage, TokenError, TokenId,
    TokenSigner,
};
use super::CapabilityScope;
use crate::config::CapabilityConfig;
use crate::lock;
use crate::security::audit::TokenSecret;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssueError {
    #[error("token ttl must be positive")]
    ZeroTtl,
    #[error("token ttl of {requested_ms}ms exceeds the {max_ms}ms maximum")]
    TtlTooLong { requested_ms: u64, max_ms: u64 },
    #[error("issuer must not be empty")]
    EmptyIssuer,
    #[error("invalid path constraint {0:?}")]
    InvalidPathConstraint(String),
    #[error("invalid domain constraint {0:?}")]
    InvalidDomainConstraint(String),
    #[error("parent token {0} does not exist")]
    UnknownParent(TokenId),
    #[error("parent token {0} is revoked, expired or consumed")]
    ParentInactive(TokenId),
    #[error("parent scope {parent} cannot delegate {child}")]
    ScopeEscalation {
        parent: CapabilityScope,
        child: CapabilityScope,
    },
    #[error("child token would outlive parent token {0}")]
    OutlivesParent(TokenId),
    #[error("child constraints are wider than parent token {0}")]
    ConstraintWidened(TokenId),
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Parameters for [`TokenManager::issue`].
#[derive(Clone, Debug)]
pub struct IssueRequest {
    scope: CapabilityScope,
    ttl: Duration,
    issuer: String,
    path_constraint: Option<String>,
    domain_constraint: Option<String>,
    resource_limits: Option<ResourceLimits>,
    parent: Option<TokenId>,
}

impl IssueRequest {
    pub fn new(scope: CapabilityScope, ttl: Duration, issuer: impl Into<String>) -> Self {
        Self {
            scope,
            ttl,
            issuer: issuer.into(),
            path_constraint: None,
            domain_constraint: None,
            resource_limits: None,
            parent: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path_constraint = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain_constraint = Some(domain.into());
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: TokenId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// What the caller is about to do with the token.
#[derive(Clone, Debug, Default)]
pub struct VerifyContext {
    path: Option<String>,
    domain: Option<String>,
    action: Option<String>,
    usage: Option<ResourceUsage>,
    emergency_override: bool,
}

impl VerifyContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub fn usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Skips scope matching. Every use is logged and audited.
    #[must_use]
    pub fn emergency_override(mut self) -> Self {
        self.emergency_override = true;
        self
    }

    fn resource(&self) -> Option<String> {
        self.path.clone().or_else(|| self.domain.clone())
    }
}

/// Why a check was refused. `Display` yields the stable reason string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    Revoked(String),
    Unknown,
    Expired { expired_at: u64 },
    IntegrityFailure,
    AlreadyUsed,
    InsufficientScope {
        granted: CapabilityScope,
        required: CapabilityScope,
    },
    PathViolation { path: Option<String>, constraint: String },
    DomainViolation { domain: Option<String>, constraint: String },
    ResourceExceeded {
        resource: &'static str,
        used: u64,
        limit: u64,
    },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revoked(reason) => write!(f, "Token revoked: {reason}"),
            Self::Unknown => f.write_str("Token not found"),
            Self::Expired { expired_at } => write!(f, "Token expired at {expired_at}"),
            Self::IntegrityFailure => f.write_str("Token integrity check failed"),
            Self::AlreadyUsed => f.write_str("Token already used"),
            Self::InsufficientScope { granted, required } => {
                write!(f, "Insufficient scope: {granted} cannot access {required}")
            }
            Self::PathViolation { path, constraint } => match path {
                Some(path) => write!(f, "Path constraint violation: {path} outside {constraint}"),
                None => write!(f, "Path constraint violation: no path given for {constraint}"),
            },
            Self::DomainViolation { domain, constraint } => match domain {
                Some(domain) => {
                    write!(f, "Domain constraint violation: {domain} is not {constraint}")
                }
                None => write!(f, "Domain constraint violation: no domain given for {constraint}"),
            },
            Self::ResourceExceeded {
                resource,
                used,
                limit,
            } => write!(f, "Resource limit exceeded: {resource} {used} > {limit}"),
        }
    }
}

/// Result of [`TokenManager::verify`]. Never an error: callers branch on it.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Granted,
    Denied(Denial),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Granted => None,
            Self::Denied(denial) => Some(denial.to_string()),
        }
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Granted => None,
            Self::Denied(denial) => Some(denial),
        }
    }
}

#[derive(Debug)]
struct Entry {
    token: CapabilityToken,
    consumed: bool,
}

#[derive(Debug)]
struct Revocation {
    reason: String,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Tables {
    active: HashMap<TokenId, Entry>,
    revoked: HashMap<TokenId, Revocation>,
    children: HashMap<TokenId, Vec<TokenId>>,
}

/// Issuing authority and sole owner of the token table.
#[derive(Debug)]
pub struct TokenManager {
    tables: Mutex<Tables>,
    signer: TokenSigner,
    max_ttl_ms: u64,
    max_audit_records: usize,
}

impl TokenManager {
    pub fn new(secret: TokenSecret, config: &CapabilityConfig) -> Result<Self, TokenError> {
        Ok(Self {
            tables: Mutex::new(Tables::default()),
            signer: TokenSigner::new(secret)?,
            max_ttl_ms: config.max_ttl_ms,
            max_audit_records: config.max_audit_records.max(1),
        })
    }

    /// Creates, signs and registers a token valid until `now + ttl`.
    pub fn issue(&self, request: IssueRequest, now: u64) -> Result<CapabilityToken, IssueError> {
        let ttl_ms = u64::try_from(request.ttl.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms == 0 {
            return Err(IssueError::ZeroTtl);
        }
        if ttl_ms > self.max_ttl_ms {
            return Err(IssueError::TtlTooLong {
                requested_ms: ttl_ms,
                max_ms: self.max_ttl_ms,
            });
        }
        if request.issuer.trim().is_empty() {
            return Err(IssueError::EmptyIssuer);
        }
        let mut path_constraint = request.path_constraint;
        if let Some(path) = &path_constraint {
            if path_components(path).is_none() {
                return Err(IssueError::InvalidPathConstraint(path.clone()));
            }
        }
        let mut domain_constraint = request.domain_constraint;
        if let Some(domain) = &domain_constraint {
            if !valid_domain(domain) {
                return Err(IssueError::InvalidDomainConstraint(domain.clone()));
            }
        }
        let mut resource_limits = request.resource_limits;

        let mut tables = lock(&self.tables);
        let expires_at = now.saturating_add(ttl_ms);
        if let Some(parent_id) = request.parent {
            let parent = match tables.active.get(&parent_id) {
                Some(entry) if !entry.consumed && !entry.token.is_expired(now) => &entry.token,
                Some(_) => return Err(IssueError::ParentInactive(parent_id)),
                None if tables.revoked.contains_key(&parent_id) => {
                    return Err(IssueError::ParentInactive(parent_id))
                }
                None => return Err(IssueError::UnknownParent(parent_id)),
            };
            if !parent.scope.authorizes(request.scope) {
                return Err(IssueError::ScopeEscalation {
                    parent: parent.scope,
                    child: request.scope,
                });
            }
            if expires_at > parent.expires_at {
                return Err(IssueError::OutlivesParent(parent_id));
            }
            path_constraint = narrow(path_constraint, &parent.path_constraint, path_within)
                .ok_or(IssueError::ConstraintWidened(parent_id))?;
            domain_constraint = narrow(domain_constraint, &parent.domain_constraint, domain_matches)
                .ok_or(IssueError::ConstraintWidened(parent_id))?;
            resource_limits = match (resource_limits, parent.resource_limits) {
                (None, outer) => outer,
                (Some(inner), Some(outer)) if !inner.within(&outer) => {
                    return Err(IssueError::ConstraintWidened(parent_id))
                }
                (inner, _) => inner,
            };
        }

        let mut token = CapabilityToken {
            id: TokenId::random(),
            scope: request.scope,
            issued_by: request.issuer,
            issued_at: now,
            expires_at,
            path_constraint,
            domain_constraint,
            resource_limits,
            parent_token_id: request.parent,
            audit_trail: Vec::new(),
            signature: [0; 32],
            checksum: [0; 32],
        };
        let claims = token.claims_bytes()?;
        token.signature = self.signer.sign(&claims)?;
        token.checksum = checksum(&claims);

        if let Some(parent_id) = request.parent {
            tables.children.entry(parent_id).or_default().push(token.id);
        }
        tables.active.insert(
            token.id,
            Entry {
                token: token.clone(),
                consumed: false,
            },
        );
        info!(
            target: "capability",
            token = %token.id,
            scope = %token.scope,
            issuer = %token.issued_by,
            expires_at,
            "token issued"
        );
        Ok(token)
    }

    /// Checks `id` for `required` under `context`; consumes single-use tokens
    /// on success.
    pub fn verify(
        &self,
        id: &TokenId,
        required: CapabilityScope,
        context: &VerifyContext,
        now: u64,
    ) -> Verdict {
        let mut tables = lock(&self.tables);
        if let Some(revocation) = tables.revoked.get(id) {
            return deny(id, Denial::Revoked(revocation.reason.clone()));
        }
        let Some(entry) = tables.active.get_mut(id) else {
            return deny(id, Denial::Unknown);
        };
        if entry.token.is_expired(now) {
            let expired_at = entry.token.expires_at;
            tables.active.remove(id);
            return deny(id, Denial::Expired { expired_at });
        }

        let mut emergency = false;
        let outcome = self.evaluate(entry, required, context, &mut emergency);
        let action = context
            .action
            .clone()
            .unwrap_or_else(|| required.as_str().to_string());
        let record = AuditRecord {
            timestamp: now,
            action,
            resource: context.resource(),
            success: outcome.is_ok(),
            emergency,
            reason: outcome.as_ref().err().map(ToString::to_string),
        };
        let trail = &mut entry.token.audit_trail;
        trail.push(record);
        if trail.len() > self.max_audit_records {
            let excess = trail.len() - self.max_audit_records;
            trail.drain(..excess);
        }

        match outcome {
            Ok(()) => {
                if entry.token.scope.is_single_use() {
                    entry.consumed = true;
                }
                debug!(target: "capability", token = %id, %required, "token check granted");
                Verdict::Granted
            }
            Err(denial) => deny(id, denial),
        }
    }

    fn evaluate(
        &self,
        entry: &Entry,
        required: CapabilityScope,
        context: &VerifyContext,
        emergency: &mut bool,
    ) -> Result<(), Denial> {
        let token = &entry.token;
        if !self.signer.authenticate(token) {
            return Err(Denial::IntegrityFailure);
        }
        if entry.consumed {
            return Err(Denial::AlreadyUsed);
        }
        if token.scope.bypasses_scope_check() || context.emergency_override {
            *emergency = true;
            warn!(
                target: "capability",
                token = %token.id,
                scope = %token.scope,
                %required,
                "emergency bypass of scope check"
            );
        } else if !token.scope.authorizes(required) {
            return Err(Denial::InsufficientScope {
                granted: token.scope,
                required,
            });
        }
        if let Some(constraint) = &token.path_constraint {
            let allowed = context
                .path
                .as_deref()
                .is_some_and(|path| path_within(path, constraint));
            if !allowed {
                return Err(Denial::PathViolation {
                    path: context.path.clone(),
                    constraint: constraint.clone(),
                });
            }
        }
        if let Some(constraint) = &token.domain_constraint {
            let allowed = context
                .domain
                .as_deref()
                .is_some_and(|domain| domain_matches(domain, constraint));
            if !allowed {
                return Err(Denial::DomainViolation {
                    domain: context.domain.clone(),
                    constraint: constraint.clone(),
                });
            }
        }
        if let (Some(limits), Some(usage)) = (&token.resource_limits, &context.usage) {
            limits.check(usage).map_err(|violation| Denial::ResourceExceeded {
                resource: violation.resource,
                used: violation.used,
                limit: violation.limit,
            })?;
        }
        Ok(())
    }

    /// Revokes `id` and every descendant. Returns false if `id` was not an
    /// active token.
    pub fn revoke(&self, id: &TokenId, reason: &str) -> bool {
        let mut tables = lock(&self.tables);
        let Some(root) = tables.active.remove(id) else {
            return false;
        };
        tables.revoked.insert(
            *id,
            Revocation {
                reason: reason.to_string(),
                expires_at: root.token.expires_at,
            },
        );
        warn!(target: "capability", token = %id, %reason, "token revoked");

        let mut visited = HashSet::from([*id]);
        let mut pending: Vec<TokenId> = vec![*id];
        let mut cascaded = 0usize;
        while let Some(parent) = pending.pop() {
            let Some(children) = tables.children.remove(&parent) else {
                continue;
            };
            for child in children {
                if !visited.insert(child) {
                    continue;
                }
                if let Some(entry) = tables.active.remove(&child) {
                    tables.revoked.insert(
                        child,
                        Revocation {
                            reason: format!("parent token {parent} revoked: {reason}"),
                            expires_at: entry.token.expires_at,
                        },
                    );
                    cascaded += 1;
                }
                pending.push(child);
            }
        }
        if cascaded > 0 {
            info!(target: "capability", token = %id, cascaded, "revocation cascaded to descendants");
        }
        true
    }

    /// Drops expired tokens and revocations of tokens that have since expired.
    /// Returns the number of tokens removed.
    pub fn purge_expired(&self, now: u64) -> usize {
        let mut tables = lock(&self.tables);
        let before = tables.active.len();
        tables.active.retain(|_, entry| !entry.token.is_expired(now));
        tables.revoked.retain(|_, revocation| now <= revocation.expires_at);
        let Tables {
            active,
            revoked,
            children,
        } = &mut *tables;
        children.retain(|parent, kids| {
            kids.retain(|kid| active.contains_key(kid) || revoked.contains_key(kid));
            !kids.is_empty() && (active.contains_key(parent) || revoked.contains_key(parent))
        });
        let removed = before - tables.active.len();
        if removed > 0 {
            debug!(target: "capability", removed, "purged expired tokens");
        }
        removed
    }

    /// Whether a presented token copy carries a valid signature and checksum.
    #[must_use]
    pub fn authenticate(&self, token: &CapabilityToken) -> bool {
        self.signer.authenticate(token)
    }

    #[must_use]
    pub fn get(&self, id: &TokenId) -> Option<CapabilityToken> {
        lock(&self.tables)
            .active
            .get(id)
            .map(|entry| entry.token.clone())
    }

    #[must_use]
    pub fn audit_trail(&self, id: &TokenId) -> Option<Vec<AuditRecord>> {
        lock(&self.tables)
            .active
            .get(id)
            .map(|entry| entry.token.audit_trail.clone())
    }

    #[must_use]
    pub fn is_revoked(&self, id: &TokenId) -> bool {
        lock(&self.tables).revoked.contains_key(id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.tables).active.len()
    }
}

fn deny(id: &TokenId, denial: Denial) -> Verdict {
    warn!(target: "capability", token = %id, reason = %denial, "token check denied");
    Verdict::Denied(denial)
}

/// Child constraint if given and inside the parent's, else the parent's.
fn narrow(
    child: Option<String>,
    parent: &Option<String>,
    inside: impl Fn(&str, &str) -> bool,
) -> Option<Option<String>> {
    match (child, parent) {
        (None, parent) => Some(parent.clone()),
        (Some(child), Some(parent)) if !inside(child.as_str(), parent.as_str()) => None,
        (child, _) => Some(child),
    }
}

/// Components of an absolute path, or `None` if it is relative or climbs.
fn path_components(path: &str) -> Option<Vec<&str>> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            part => parts.push(part),
        }
    }
    Some(parts)
}

/// Component-wise prefix match: `/a/b` contains `/a/b` and `/a/b/c`, not `/a/bc`.
fn path_within(path: &str, constraint: &str) -> bool {
    match (path_components(path), path_components(constraint)) {
        (Some(path), Some(constraint)) => path.starts_with(&constraint),
        _ => false,
    }
}

fn valid_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    !domain.is_empty()
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

fn domain_matches(domain: &str, constraint: &str) -> bool {
    domain
        .trim_end_matches('.')
        .eq_ignore_ascii_case(constraint.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn manager() -> TokenManager {
        TokenManager::new(Zeroizing::new(vec![0x42; 32]), &CapabilityConfig::default()).unwrap()
    }

    fn issue(manager: &TokenManager, scope: CapabilityScope, ttl_ms: u64, now: u64) -> TokenId {
        manager
            .issue(IssueRequest::new(scope, Duration::from_millis(ttl_ms), "node-a"), now)
            .unwrap()
            .id
    }

    fn ctx() -> VerifyContext {
        VerifyContext::new()
    }

    #[test]
    fn node_local_token_expires_after_ttl() {
        let manager = manager();
        let t1 = issue(&manager, CapabilityScope::NodeLocal, 5_000, 1_000);
        assert!(manager.verify(&t1, CapabilityScope::FsRead, &ctx(), 1_000).is_valid());
        let verdict = manager.verify(&t1, CapabilityScope::FsRead, &ctx(), 7_000);
        assert!(!verdict.is_valid());
        assert!(verdict.reason().unwrap().contains("expired"));
        // Expired tokens are forgotten on sight.
        assert_eq!(manager.active_count(), 0);
        assert_eq!(
            manager.verify(&t1, CapabilityScope::FsRead, &ctx(), 7_001),
            Verdict::Denied(Denial::Unknown)
        );
    }

    #[test]
    fn token_is_valid_up_to_its_expiry_instant() {
        let manager = manager();
        let id = issue(&manager, CapabilityScope::FsRead, 100, 0);
        assert!(manager.verify(&id, CapabilityScope::FsRead, &ctx(), 100).is_valid());
        assert!(!manager.verify(&id, CapabilityScope::FsRead, &ctx(), 101).is_valid());
    }

    #[test]
    fn admin_grants_everything_and_fs_read_is_not_fs_write() {
        let manager = manager();
        let admin = issue(&manager, CapabilityScope::Admin, 60_000, 0);
        for scope in CapabilityScope::ALL {
            assert!(manager.verify(&admin, scope, &ctx(), 1).is_valid(), "{scope}");
        }
        let reader = issue(&manager, CapabilityScope::FsRead, 60_000, 0);
        let verdict = manager.verify(&reader, CapabilityScope::FsWrite, &ctx(), 1);
        assert_eq!(
            verdict.reason().unwrap(),
            "Insufficient scope: FS_READ cannot access FS_WRITE"
        );
    }

    #[test]
    fn path_constraint_matches_whole_components() {
        let manager = manager();
        let id = manager
            .issue(
                IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(60), "node-a")
                    .with_path("/var/ippoc/safe"),
                0,
            )
            .unwrap()
            .id;
        let check = |path: &str| {
            manager
                .verify(&id, CapabilityScope::FsRead, &ctx().path(path), 1)
                .is_valid()
        };
        assert!(check("/var/ippoc/safe/log.txt"));
        assert!(check("/var/ippoc/safe"));
        assert!(!check("/etc/passwd"));
        assert!(!check("/var/ippoc/safer/log.txt"));
        assert!(!check("/var/ippoc/safe/../../../etc/passwd"));
        let missing = manager.verify(&id, CapabilityScope::FsRead, &ctx(), 1);
        assert!(missing.reason().unwrap().starts_with("Path constraint violation"));
    }

    #[test]
    fn domain_constraint_is_exact_and_case_insensitive() {
        let manager = manager();
        let id = manager
            .issue(
                IssueRequest::new(CapabilityScope::Network, Duration::from_secs(60), "node-a")
                    .with_domain("api.ippoc.net"),
                0,
            )
            .unwrap()
            .id;
        let check = |domain: &str| {
            manager
                .verify(&id, CapabilityScope::Network, &ctx().domain(domain), 1)
                .is_valid()
        };
        assert!(check("API.ippoc.net"));
        assert!(!check("evil.api.ippoc.net"));
        assert!(!check("ippoc.net"));
    }

    #[test]
    fn wasm_exec_token_is_single_use() {
        let manager = manager();
        let id = issue(&manager, CapabilityScope::WasmExec, 60_000, 0);
        assert!(manager.verify(&id, CapabilityScope::WasmExec, &ctx(), 1).is_valid());
        let second = manager.verify(&id, CapabilityScope::WasmExec, &ctx(), 2);
        assert_eq!(second, Verdict::Denied(Denial::AlreadyUsed));
        assert_eq!(second.reason().unwrap(), "Token already used");
    }

    #[test]
    fn failed_check_does_not_consume_single_use_token() {
        let manager = manager();
        let id = issue(&manager, CapabilityScope::Temporary, 60_000, 0);
        assert!(!manager.verify(&id, CapabilityScope::Admin, &ctx(), 1).is_valid());
        assert!(manager.verify(&id, CapabilityScope::Temporary, &ctx(), 2).is_valid());
        assert!(!manager.verify(&id, CapabilityScope::Temporary, &ctx(), 3).is_valid());
    }

    #[test]
    fn emergency_bypass_is_audited() {
        let manager = manager();
        let id = issue(&manager, CapabilityScope::Emergency, 60_000, 0);
        assert!(manager.verify(&id, CapabilityScope::Admin, &ctx(), 1).is_valid());
        let trail = manager.audit_trail(&id).unwrap();
        assert_eq!(trail.len(), 1);
        assert!(trail[0].emergency && trail[0].success);
        assert_eq!(trail[0].action, "ADMIN");

        let reader = issue(&manager, CapabilityScope::FsRead, 60_000, 0);
        let overridden = ctx().emergency_override().action("incident-response");
        assert!(manager.verify(&reader, CapabilityScope::Security, &overridden, 1).is_valid());
        let trail = manager.audit_trail(&reader).unwrap();
        assert!(trail[0].emergency);
        assert_eq!(trail[0].action, "incident-response");
    }

    #[test]
    fn revocation_cascades_through_grandchildren() {
        let manager = manager();
        let root = issue(&manager, CapabilityScope::Admin, 60_000, 0);
        let child = manager
            .issue(
                IssueRequest::new(CapabilityScope::NodeLocal, Duration::from_secs(30), "node-a")
                    .with_parent(root),
                0,
            )
            .unwrap()
            .id;
        let grandchild = manager
            .issue(
                IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(10), "node-a")
                    .with_parent(child),
                0,
            )
            .unwrap()
            .id;
        let unrelated = issue(&manager, CapabilityScope::FsRead, 60_000, 0);

        assert!(manager.revoke(&root, "compromised"));
        assert!(!manager.revoke(&root, "again"));
        assert_eq!(
            manager.verify(&root, CapabilityScope::FsRead, &ctx(), 1).reason().unwrap(),
            "Token revoked: compromised"
        );
        for id in [child, grandchild] {
            let reason = manager.verify(&id, CapabilityScope::FsRead, &ctx(), 1).reason().unwrap();
            assert!(reason.starts_with("Token revoked: parent token"), "{reason}");
            assert!(reason.ends_with("compromised"));
        }
        assert!(manager.verify(&unrelated, CapabilityScope::FsRead, &ctx(), 1).is_valid());
    }

    #[test]
    fn delegation_cannot_escalate_or_outlive_parent() {
        let manager = manager();
        let parent = manager
            .issue(
                IssueRequest::new(CapabilityScope::NodeLocal, Duration::from_secs(10), "node-a")
                    .with_path("/srv"),
                0,
            )
            .unwrap()
            .id;
        let escalate = IssueRequest::new(CapabilityScope::Network, Duration::from_secs(1), "b")
            .with_parent(parent);
        assert!(matches!(
            manager.issue(escalate, 0),
            Err(IssueError::ScopeEscalation { .. })
        ));
        let outlive = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(11), "b")
            .with_parent(parent);
        assert_eq!(manager.issue(outlive, 0), Err(IssueError::OutlivesParent(parent)));
        let widen = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), "b")
            .with_path("/etc")
            .with_parent(parent);
        assert_eq!(manager.issue(widen, 0), Err(IssueError::ConstraintWidened(parent)));

        let inherited = manager
            .issue(
                IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), "b")
                    .with_parent(parent),
                0,
            )
            .unwrap();
        assert_eq!(inherited.path_constraint.as_deref(), Some("/srv"));

        let orphan = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), "b")
            .with_parent(TokenId::random());
        assert!(matches!(manager.issue(orphan, 0), Err(IssueError::UnknownParent(_))));

        manager.revoke(&parent, "rotated");
        let after = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), "b")
            .with_parent(parent);
        assert_eq!(manager.issue(after, 0), Err(IssueError::ParentInactive(parent)));
    }

    #[test]
    fn issuance_validates_inputs() {
        let manager = manager();
        let zero = IssueRequest::new(CapabilityScope::FsRead, Duration::ZERO, "a");
        assert_eq!(manager.issue(zero, 0), Err(IssueError::ZeroTtl));
        let long = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(86_401), "a");
        assert!(matches!(manager.issue(long, 0), Err(IssueError::TtlTooLong { .. })));
        let anonymous = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), " ");
        assert_eq!(manager.issue(anonymous, 0), Err(IssueError::EmptyIssuer));
        let relative = IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), "a")
            .with_path("var/log");
        assert!(matches!(
            manager.issue(relative, 0),
            Err(IssueError::InvalidPathConstraint(_))
        ));
        let domain = IssueRequest::new(CapabilityScope::Network, Duration::from_secs(1), "a")
            .with_domain("bad domain");
        assert!(matches!(
            manager.issue(domain, 0),
            Err(IssueError::InvalidDomainConstraint(_))
        ));
    }

    #[test]
    fn resource_limits_are_enforced_when_usage_is_reported() {
        let manager = manager();
        let limits = ResourceLimits {
            max_memory_bytes: Some(64 * 1024 * 1024),
            ..ResourceLimits::default()
        };
        let id = manager
            .issue(
                IssueRequest::new(CapabilityScope::ProcessExec, Duration::from_secs(60), "a")
                    .with_limits(limits),
                0,
            )
            .unwrap()
            .id;
        let small = ResourceUsage {
            memory_bytes: 1024,
            ..ResourceUsage::default()
        };
        let huge = ResourceUsage {
            memory_bytes: u64::MAX,
            ..ResourceUsage::default()
        };
        assert!(manager
            .verify(&id, CapabilityScope::ProcessExec, &ctx().usage(small), 1)
            .is_valid());
        let verdict = manager.verify(&id, CapabilityScope::ProcessExec, &ctx().usage(huge), 2);
        assert!(matches!(
            verdict.denial(),
            Some(Denial::ResourceExceeded { resource: "memory", .. })
        ));
    }

    #[test]
    fn denials_are_audited_and_trail_is_capped() {
        let config = CapabilityConfig {
            max_audit_records: 3,
            ..CapabilityConfig::default()
        };
        let manager = TokenManager::new(Zeroizing::new(vec![1; 32]), &config).unwrap();
        let id = issue(&manager, CapabilityScope::FsRead, 60_000, 0);
        for now in 1..=5 {
            let _ = manager.verify(&id, CapabilityScope::FsWrite, &ctx(), now);
        }
        let trail = manager.audit_trail(&id).unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].timestamp, 3);
        assert!(trail.iter().all(|record| !record.success && record.reason.is_some()));
    }

    #[test]
    fn tampered_copies_fail_authentication() {
        let manager = manager();
        let token = manager
            .issue(IssueRequest::new(CapabilityScope::FsRead, Duration::from_secs(1), "a"), 0)
            .unwrap();
        assert!(manager.authenticate(&token));
        let mut forged = token;
        forged.scope = CapabilityScope::Admin;
        assert!(!manager.authenticate(&forged));
    }

    #[test]
    fn purge_drops_expired_tokens_and_stale_revocations() {
        let manager = manager();
        let short = issue(&manager, CapabilityScope::FsRead, 10, 0);
        let long = issue(&manager, CapabilityScope::FsRead, 10_000, 0);
        let revoked = issue(&manager, CapabilityScope::FsRead, 20, 0);
        manager.revoke(&revoked, "test");
        assert_eq!(manager.purge_expired(15), 1);
        assert!(manager.get(&short).is_none());
        assert!(manager.get(&long).is_some());
        assert!(manager.is_revoked(&revoked));
        manager.purge_expired(21);
        assert!(!manager.is_revoked(&revoked));
    }

    #[test]
    fn concurrent_single_use_checks_grant_once() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(manager());
        let id = issue(&manager, CapabilityScope::Maintenance, 60_000, 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    manager
                        .verify(&id, CapabilityScope::Maintenance, &VerifyContext::new(), 1)
                        .is_valid()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }
}
