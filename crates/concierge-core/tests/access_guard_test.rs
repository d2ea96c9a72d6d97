//! Integration test: Access Guard: authentication, scope checks, lockout timing,
//! rate windows and audit logging.
//!
//! ## Scenarios
//! 1. Unknown identities are refused and audited without creating a session.
//! 2. Phone numbers match in any spelling.
//! 3. Requests outside the identity scope are refused.
//! 4. N consecutive failures lock the identity for exactly the configured duration.
//! 5. Denials while locked do not extend the lockout.
//! 6. Rate windows refuse the request that would exceed the ceiling.
//! 7. Concurrent identities never share failure counts.
//! 8. The sled audit log records every outcome.

use chrono::NaiveDate;
use concierge_core::config::{GuardConfig, RateLimits, RateWindow};
use concierge_core::{
    AccessDenied, AccessGuard, AuditOutcome, AuditSink, AuthorizedScope, DenialClass, EntityId,
    Identity, IdentityRegistry, ManualClock, MemoryAuditLog, Role, Scope, SledAuditLog,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const CLIENT: &str = "+17865550101";
const OTHER_CLIENT: &str = "+17865550102";
const ADMIN: &str = "+17865550199";

fn ids(list: &[&str]) -> BTreeSet<EntityId> {
    list.iter().map(|s| EntityId::new(*s)).collect()
}

fn registry() -> Arc<IdentityRegistry> {
    Arc::new(
        IdentityRegistry::from_identities(vec![
            Identity::new(CLIENT, Role::Client, Scope::Entities(ids(&["c1", "m1"]))),
            Identity::new(OTHER_CLIENT, Role::Client, Scope::Entities(ids(&["c2"]))),
            Identity::new(ADMIN, Role::Admin, Scope::All),
        ])
        .unwrap(),
    )
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()))
}

fn lockout_config() -> GuardConfig {
    GuardConfig {
        lockout_threshold: 3,
        lockout_secs: 900,
        ..GuardConfig::default()
    }
}

fn guard(config: GuardConfig, clock: Arc<ManualClock>, audit: Arc<dyn AuditSink>) -> AccessGuard {
    AccessGuard::new(registry(), audit, clock, config)
}

// ---------------------------------------------------------------------------
// 1–3. Authentication and scope
// ---------------------------------------------------------------------------

#[test]
fn unknown_identity_is_refused_and_audited() {
    let audit = Arc::new(MemoryAuditLog::new());
    let guard = guard(GuardConfig::default(), clock(), audit.clone());

    assert_eq!(
        guard.authorize("+1 (305) 555-0000", &BTreeSet::new()),
        Err(AccessDenied::Unauthorized)
    );
    assert!(guard.session("+13055550000").is_none());
    let entries = audit.entries_for("+13055550000");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Denied(DenialClass::Unauthorized));
}

#[test]
fn phone_spellings_resolve_to_one_identity() {
    let guard = guard(GuardConfig::default(), clock(), Arc::new(MemoryAuditLog::new()));
    for spelling in ["+1 (786) 555-0101", "1-786-555-0101", "17865550101", "+1.786.555.0101"] {
        assert!(
            guard.authorize(spelling, &BTreeSet::new()).is_ok(),
            "{spelling} should authorize"
        );
    }
    assert!(guard.session(CLIENT).is_some());
}

#[test]
fn scope_is_enforced() {
    let guard = guard(GuardConfig::default(), clock(), Arc::new(MemoryAuditLog::new()));

    assert_eq!(
        guard.authorize(CLIENT, &ids(&["m1"])),
        Ok(AuthorizedScope::Entities(ids(&["m1"])))
    );
    assert_eq!(guard.authorize(CLIENT, &ids(&["c1", "c2"])), Err(AccessDenied::ScopeDenied));
    assert_eq!(
        guard.authorize(CLIENT, &BTreeSet::new()),
        Ok(AuthorizedScope::Entities(ids(&["c1", "m1"])))
    );
    assert_eq!(guard.authorize(ADMIN, &ids(&["c2", "c9"])), Ok(AuthorizedScope::Entities(ids(&["c2", "c9"]))));
}

// ---------------------------------------------------------------------------
// 4–5. Lockout timing
// ---------------------------------------------------------------------------

#[test]
fn lockout_lasts_exactly_the_configured_duration() {
    let clock = clock();
    let guard = guard(lockout_config(), clock.clone(), Arc::new(MemoryAuditLog::new()));
    let outside = ids(&["c2"]);

    for _ in 0..3 {
        assert_eq!(guard.authorize(CLIENT, &outside), Err(AccessDenied::ScopeDenied));
    }
    let session = guard.session(CLIENT).unwrap();
    assert_eq!(session.failed_attempts, 3);
    assert!(session.locked_until.is_some());

    // Even a valid request is refused while locked.
    assert_eq!(guard.authorize(CLIENT, &BTreeSet::new()), Err(AccessDenied::LockedOut));

    clock.advance(Duration::from_secs(900) - Duration::from_millis(1));
    assert_eq!(guard.authorize(CLIENT, &BTreeSet::new()), Err(AccessDenied::LockedOut));

    clock.advance(Duration::from_millis(2));
    assert!(guard.authorize(CLIENT, &BTreeSet::new()).is_ok());
    let session = guard.session(CLIENT).unwrap();
    assert_eq!(session.failed_attempts, 0);
    assert!(session.locked_until.is_none());
}

#[test]
fn denials_while_locked_do_not_extend_the_lockout() {
    let clock = clock();
    let guard = guard(lockout_config(), clock.clone(), Arc::new(MemoryAuditLog::new()));
    let outside = ids(&["c2"]);
    for _ in 0..3 {
        let _ = guard.authorize(CLIENT, &outside);
    }
    let until = guard.session(CLIENT).unwrap().locked_until.unwrap();

    for _ in 0..10 {
        clock.advance(Duration::from_secs(60));
        assert_eq!(guard.authorize(CLIENT, &outside), Err(AccessDenied::LockedOut));
    }
    assert_eq!(guard.session(CLIENT).unwrap().locked_until, Some(until));

    clock.advance(Duration::from_secs(301));
    assert!(guard.authorize(CLIENT, &BTreeSet::new()).is_ok());
}

#[test]
fn fewer_failures_than_threshold_do_not_lock() {
    let guard = guard(lockout_config(), clock(), Arc::new(MemoryAuditLog::new()));
    let outside = ids(&["c2"]);
    for _ in 0..2 {
        let _ = guard.authorize(CLIENT, &outside);
    }
    assert!(guard.authorize(CLIENT, &BTreeSet::new()).is_ok());
    for _ in 0..2 {
        let _ = guard.authorize(CLIENT, &outside);
    }
    // Counter was reset by the success in between.
    assert!(guard.authorize(CLIENT, &BTreeSet::new()).is_ok());
}

// ---------------------------------------------------------------------------
// 6. Rate windows
// ---------------------------------------------------------------------------

#[test]
fn rate_limit_per_role() {
    let config = GuardConfig {
        rate_limits: RateLimits {
            client: vec![
                RateWindow { window_secs: 60, max_requests: 3 },
                RateWindow { window_secs: 3600, max_requests: 5 },
            ],
            admin: vec![RateWindow { window_secs: 60, max_requests: 100 }],
        },
        ..GuardConfig::default()
    };
    let clock = clock();
    let guard = guard(config, clock.clone(), Arc::new(MemoryAuditLog::new()));
    let none = BTreeSet::new();

    for _ in 0..3 {
        assert!(guard.authorize(CLIENT, &none).is_ok());
    }
    assert_eq!(guard.authorize(CLIENT, &none), Err(AccessDenied::RateLimited));

    clock.advance(Duration::from_secs(61));
    assert!(guard.authorize(CLIENT, &none).is_ok());
    assert!(guard.authorize(CLIENT, &none).is_ok());
    // Hourly ceiling of 5 reached even though the minute window has room.
    assert_eq!(guard.authorize(CLIENT, &none), Err(AccessDenied::RateLimited));

    for _ in 0..10 {
        assert!(guard.authorize(ADMIN, &none).is_ok());
    }
}

// ---------------------------------------------------------------------------
// 7. Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_identities_keep_separate_state() {
    let config = GuardConfig {
        lockout_threshold: 1000,
        rate_limits: RateLimits {
            client: vec![],
            admin: vec![],
        },
        ..GuardConfig::default()
    };
    let guard = guard(config, clock(), Arc::new(MemoryAuditLog::new()));
    let outside = ids(&["c9"]);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    assert_eq!(guard.authorize(CLIENT, &outside), Err(AccessDenied::ScopeDenied));
                }
            });
            s.spawn(|| {
                for _ in 0..50 {
                    assert!(guard.authorize(OTHER_CLIENT, &BTreeSet::new()).is_ok());
                }
            });
        }
    });

    assert_eq!(guard.session(CLIENT).unwrap().failed_attempts, 200);
    assert_eq!(guard.session(OTHER_CLIENT).unwrap().failed_attempts, 0);
}

// ---------------------------------------------------------------------------
// 8. Persistent audit
// ---------------------------------------------------------------------------

#[test]
fn sled_audit_records_every_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(SledAuditLog::open(Some(dir.path().join("audit"))).unwrap());
    let guard = guard(lockout_config(), clock(), audit.clone());

    let _ = guard.authorize(CLIENT, &BTreeSet::new());
    let _ = guard.authorize(CLIENT, &ids(&["c2"]));
    let _ = guard.authorize("+10000000000", &BTreeSet::new());

    let outcomes: Vec<AuditOutcome> = audit.entries_for(CLIENT).into_iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AuditOutcome::Allowed,
            AuditOutcome::Denied(DenialClass::ScopeDenied)
        ]
    );
    assert_eq!(audit.entries_for("+10000000000").len(), 1);
}
