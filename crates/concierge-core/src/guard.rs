//! Access Guard: authenticates the caller, enforces lockout and rate limits, checks
//! the requested entities against the identity's scope, and audits every outcome.
//!
//! Evaluation order for a registered identity:
//! 1. locked out → `LockedOut` (does not extend the lockout)
//! 2. rate window full → `RateLimited`
//! 3. requested entities outside scope → `ScopeDenied`
//!
//! Every denial of a registered identity other than `LockedOut` counts as a failed
//! attempt; reaching the threshold locks the identity for the configured duration.
//! A successful authorization resets the count. Sessions live in a concurrent map
//! so requests from different identities never contend on one lock.

use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditOutcome, AuditSink, DenialClass};
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::AccessDenied;
use crate::hierarchy::{EntityId, EntityTree, Level};
use crate::identity::{normalize_phone, Identity, IdentityRegistry, Permission, Scope};

/// Scope granted for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizedScope {
    All,
    Entities(BTreeSet<EntityId>),
}

impl AuthorizedScope {
    /// Root entities to plan from: every Top entity for `All`, otherwise the granted
    /// entities that exist in the catalog.
    pub fn roots(&self, tree: &EntityTree) -> BTreeSet<EntityId> {
        match self {
            AuthorizedScope::All => tree.entities_at(Level::Top),
            AuthorizedScope::Entities(set) => set.iter().filter(|e| tree.contains(e)).cloned().collect(),
        }
    }
}

/// Per-identity guard state.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub identity: Arc<Identity>,
    pub failed_attempts: u32,
    pub locked_until: Option<Instant>,
    /// Instants of accepted requests, oldest first.
    pub request_times: VecDeque<Instant>,
    pub last_seen: Instant,
}

impl AuthSession {
    fn new(identity: Arc<Identity>, now: Instant) -> Self {
        Self {
            identity,
            failed_attempts: 0,
            locked_until: None,
            request_times: VecDeque::new(),
            last_seen: now,
        }
    }

    pub fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

pub struct AccessGuard {
    registry: Arc<IdentityRegistry>,
    sessions: DashMap<String, AuthSession>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
}

impl AccessGuard {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: GuardConfig,
    ) -> Self {
        Self {
            registry,
            sessions: DashMap::new(),
            audit,
            clock,
            config,
        }
    }

    /// Registered identity for any spelling of `identity_key`.
    pub fn identity(&self, identity_key: &str) -> Option<Arc<Identity>> {
        self.registry.lookup(identity_key)
    }

    /// Authorizes one request for `requested` entities (empty means "everything I may see").
    pub fn authorize(
        &self,
        identity_key: &str,
        requested: &BTreeSet<EntityId>,
    ) -> Result<AuthorizedScope, AccessDenied> {
        let key = normalize_phone(identity_key);
        let Some(identity) = self.registry.lookup(&key) else {
            warn!(target: "concierge::guard", identity = %key, "Unknown identity");
            self.audit
                .append(&key, AuditOutcome::Denied(DenialClass::Unauthorized));
            return Err(AccessDenied::Unauthorized);
        };

        let now = self.clock.now();
        let outcome = {
            let mut entry = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| AuthSession::new(identity.clone(), now));
            let session = entry.value_mut();
            session.last_seen = now;
            self.evaluate(session, requested, now)
        };

        match &outcome {
            Ok(_) => {
                debug!(target: "concierge::guard", identity = %key, role = identity.role.as_str(), "Authorized");
                self.audit.append(&key, AuditOutcome::Allowed);
            }
            Err(denied) => {
                info!(target: "concierge::guard", identity = %key, reason = %denied, "Request denied");
                self.audit.append(&key, AuditOutcome::Denied(denied.class()));
            }
        }
        outcome
    }

    fn evaluate(
        &self,
        session: &mut AuthSession,
        requested: &BTreeSet<EntityId>,
        now: Instant,
    ) -> Result<AuthorizedScope, AccessDenied> {
        if let Some(until) = session.locked_until {
            if now < until {
                return Err(AccessDenied::LockedOut);
            }
            session.locked_until = None;
            session.failed_attempts = 0;
        }

        let limits = self.config.rate_limits.for_role(session.identity.role);
        let longest = limits
            .iter()
            .map(|l| l.window())
            .max()
            .unwrap_or(Duration::ZERO);
        while let Some(oldest) = session.request_times.front() {
            if now.saturating_duration_since(*oldest) >= longest {
                session.request_times.pop_front();
            } else {
                break;
            }
        }
        let over_limit = limits.iter().any(|limit| {
            let in_window = session
                .request_times
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < limit.window())
                .count();
            in_window >= limit.max_requests as usize
        });
        if over_limit {
            return Err(self.fail(session, AccessDenied::RateLimited, now));
        }

        if !requested.is_empty() && !session.identity.scope.covers(requested) {
            return Err(self.fail(session, AccessDenied::ScopeDenied, now));
        }

        session.request_times.push_back(now);
        session.failed_attempts = 0;
        Ok(if requested.is_empty() {
            match &session.identity.scope {
                Scope::All => AuthorizedScope::All,
                Scope::Entities(set) => AuthorizedScope::Entities(set.clone()),
            }
        } else {
            AuthorizedScope::Entities(requested.clone())
        })
    }

    fn fail(&self, session: &mut AuthSession, reason: AccessDenied, now: Instant) -> AccessDenied {
        session.failed_attempts += 1;
        if session.failed_attempts >= self.config.lockout_threshold {
            session.locked_until = Some(now + self.config.lockout_duration());
            warn!(
                target: "concierge::guard",
                identity = %session.identity.key,
                failed_attempts = session.failed_attempts,
                lockout_secs = self.config.lockout_secs,
                "Identity locked out"
            );
        }
        reason
    }

    /// Checks an operation permission for an identity that already passed
    /// [`authorize`](Self::authorize). A missing permission counts as a failed attempt.
    pub fn check_permission(&self, identity_key: &str, permission: Permission) -> Result<(), AccessDenied> {
        let key = normalize_phone(identity_key);
        let Some(identity) = self.registry.lookup(&key) else {
            self.audit
                .append(&key, AuditOutcome::Denied(DenialClass::Unauthorized));
            return Err(AccessDenied::Unauthorized);
        };
        if identity.has_permission(permission) {
            return Ok(());
        }

        let now = self.clock.now();
        {
            let mut entry = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| AuthSession::new(identity.clone(), now));
            self.fail(entry.value_mut(), AccessDenied::PermissionDenied, now);
        }
        info!(target: "concierge::guard", identity = %key, permission = ?permission, "Permission denied");
        self.audit
            .append(&key, AuditOutcome::Denied(DenialClass::PermissionDenied));
        Err(AccessDenied::PermissionDenied)
    }

    /// Audits a refusal decided outside the guard (topic filter).
    pub fn record_denial(&self, identity_key: &str, class: DenialClass) {
        self.audit
            .append(&normalize_phone(identity_key), AuditOutcome::Denied(class));
    }

    pub fn session(&self, identity_key: &str) -> Option<AuthSession> {
        self.sessions
            .get(&normalize_phone(identity_key))
            .map(|s| s.value().clone())
    }

    /// Drops sessions idle longer than the session TTL, keeping any still locked.
    /// Returns how many were removed.
    pub fn prune_idle_sessions(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.session_ttl();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.is_locked(now) || now.saturating_duration_since(s.last_seen) < ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(target: "concierge::guard", removed, "Idle sessions pruned");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::clock::ManualClock;
    use crate::config::{RateLimits, RateWindow};
    use crate::identity::Role;
    use chrono::NaiveDate;

    fn guard_with(config: GuardConfig) -> (AccessGuard, Arc<ManualClock>, Arc<MemoryAuditLog>) {
        let registry = IdentityRegistry::from_identities(vec![
            Identity::new(
                "+15550001",
                Role::Client,
                Scope::Entities(BTreeSet::from(["c1".into()])),
            ),
            Identity::new("+15550002", Role::Admin, Scope::All),
        ])
        .unwrap();
        let clock = Arc::new(ManualClock::new(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()));
        let audit = Arc::new(MemoryAuditLog::new());
        let guard = AccessGuard::new(Arc::new(registry), audit.clone(), clock.clone(), config);
        (guard, clock, audit)
    }

    #[test]
    fn unscoped_request_gets_full_scope() {
        let (guard, _, _) = guard_with(GuardConfig::default());
        assert_eq!(
            guard.authorize("+1 555 0001", &BTreeSet::new()),
            Ok(AuthorizedScope::Entities(BTreeSet::from(["c1".into()])))
        );
        assert_eq!(
            guard.authorize("+15550002", &BTreeSet::new()),
            Ok(AuthorizedScope::All)
        );
    }

    #[test]
    fn unknown_identity_creates_no_session() {
        let (guard, _, audit) = guard_with(GuardConfig::default());
        assert_eq!(
            guard.authorize("+19990000", &BTreeSet::new()),
            Err(AccessDenied::Unauthorized)
        );
        assert!(guard.session("+19990000").is_none());
        assert_eq!(
            audit.entries_for("+19990000")[0].outcome,
            AuditOutcome::Denied(DenialClass::Unauthorized)
        );
    }

    #[test]
    fn success_resets_failed_attempts() {
        let (guard, _, _) = guard_with(GuardConfig::default());
        let outside = BTreeSet::from(["c9".into()]);
        for _ in 0..3 {
            assert_eq!(guard.authorize("+15550001", &outside), Err(AccessDenied::ScopeDenied));
        }
        assert_eq!(guard.session("+15550001").unwrap().failed_attempts, 3);
        assert!(guard.authorize("+15550001", &BTreeSet::new()).is_ok());
        assert_eq!(guard.session("+15550001").unwrap().failed_attempts, 0);
    }

    #[test]
    fn rate_window_slides() {
        let config = GuardConfig {
            rate_limits: RateLimits {
                client: vec![RateWindow { window_secs: 60, max_requests: 2 }],
                admin: vec![],
            },
            ..GuardConfig::default()
        };
        let (guard, clock, _) = guard_with(config);
        let none = BTreeSet::new();
        assert!(guard.authorize("+15550001", &none).is_ok());
        assert!(guard.authorize("+15550001", &none).is_ok());
        assert_eq!(guard.authorize("+15550001", &none), Err(AccessDenied::RateLimited));
        clock.advance(Duration::from_secs(61));
        assert!(guard.authorize("+15550001", &none).is_ok());
    }

    #[test]
    fn permission_denial_counts_toward_lockout() {
        let config = GuardConfig {
            lockout_threshold: 2,
            ..GuardConfig::default()
        };
        let (guard, _, _) = guard_with(config);
        assert!(guard.check_permission("+15550001", Permission::Read).is_ok());
        assert_eq!(
            guard.check_permission("+15550001", Permission::Send),
            Err(AccessDenied::PermissionDenied)
        );
        assert_eq!(
            guard.check_permission("+15550001", Permission::Delete),
            Err(AccessDenied::PermissionDenied)
        );
        assert_eq!(
            guard.authorize("+15550001", &BTreeSet::new()),
            Err(AccessDenied::LockedOut)
        );
    }

    #[test]
    fn prune_keeps_locked_and_recent_sessions() {
        let config = GuardConfig {
            lockout_threshold: 1,
            lockout_secs: 7200,
            session_ttl_secs: 60,
            ..GuardConfig::default()
        };
        let (guard, clock, _) = guard_with(config);
        assert!(guard.authorize("+15550002", &BTreeSet::new()).is_ok());
        let _ = guard.authorize("+15550001", &BTreeSet::from(["c9".into()]));
        clock.advance(Duration::from_secs(120));
        assert_eq!(guard.prune_idle_sessions(), 1);
        assert!(guard.session("+15550002").is_none());
        assert!(guard.session("+15550001").is_some());
    }
}
