//! Runtime configuration: lockout policy, rate windows, fetch retry and timeout
//! budgets, oracle budget and planner level. Loaded from an optional TOML file
//! overlaid with `CONCIERGE__*` environment variables.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | guard.lockout_threshold | 5 | Consecutive failed authorizations before lockout. |
//! | guard.lockout_secs | 900 | Lockout duration (15 minutes). |
//! | guard.session_ttl_secs | 3600 | Idle sessions older than this are pruned. |
//! | guard.rate_limits.client / .admin | 10/min, 100/h · 100/min, 1000/h | Sliding windows per role. |
//! | aggregation.max_attempts | 3 | Attempts per entity fetch on transient errors. |
//! | aggregation.backoff_base_ms | 500 | First retry delay; doubles each attempt. |
//! | aggregation.request_timeout_ms | 20000 | Overall budget for one request's fetches. |
//! | aggregation.max_concurrency | 4 | Entity fetches in flight. |
//! | oracle.timeout_ms | 8000 | Budget per oracle call. |
//! | oracle.retries | 1 | Extra attempts after an oracle timeout. |
//! | planner.faithful_level | mid | Finest level the source reports events faithfully at. |
//! | planner.location_dimension | city | Breakdown dimension used for location filters. |
//! | utc_offset_minutes | 0 | Account offset used to resolve "today". |
//!
//! Environment overrides use `__` between sections, e.g.
//! `CONCIERGE__GUARD__LOCKOUT_THRESHOLD=3`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::hierarchy::Level;
use crate::identity::Role;

fn default_lockout_threshold() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    15 * 60
}

fn default_session_ttl_secs() -> u64 {
    60 * 60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_oracle_timeout_ms() -> u64 {
    8_000
}

fn default_oracle_retries() -> u32 {
    1
}

fn default_faithful_level() -> Level {
    Level::Mid
}

fn default_location_dimension() -> String {
    "city".to_string()
}

/// At most `max_requests` accepted requests within any `window_secs` span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl RateWindow {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_client_limits() -> Vec<RateWindow> {
    vec![
        RateWindow { window_secs: 60, max_requests: 10 },
        RateWindow { window_secs: 3600, max_requests: 100 },
    ]
}

fn default_admin_limits() -> Vec<RateWindow> {
    vec![
        RateWindow { window_secs: 60, max_requests: 100 },
        RateWindow { window_secs: 3600, max_requests: 1000 },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default = "default_client_limits")]
    pub client: Vec<RateWindow>,
    #[serde(default = "default_admin_limits")]
    pub admin: Vec<RateWindow>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            client: default_client_limits(),
            admin: default_admin_limits(),
        }
    }
}

impl RateLimits {
    pub fn for_role(&self, role: Role) -> &[RateWindow] {
        match role {
            Role::Client => &self.client,
            Role::Admin => &self.admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub rate_limits: RateLimits,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lockout_threshold: default_lockout_threshold(),
            lockout_secs: default_lockout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            rate_limits: RateLimits::default(),
        }
    }
}

impl GuardConfig {
    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl AggregationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_oracle_retries")]
    pub retries: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_oracle_timeout_ms(),
            retries: default_oracle_retries(),
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_faithful_level")]
    pub faithful_level: Level,
    #[serde(default = "default_location_dimension")]
    pub location_dimension: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            faithful_level: default_faithful_level(),
            location_dimension: default_location_dimension(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl ConciergeConfig {
    /// Loads `CONCIERGE_CONFIG` (default `config/concierge.toml`) when present, then
    /// applies `CONCIERGE__*` environment overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONCIERGE_CONFIG").unwrap_or_else(|_| "config/concierge.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CONCIERGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        built.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = ConciergeConfig::default();
        assert_eq!(cfg.guard.lockout_threshold, 5);
        assert_eq!(cfg.guard.lockout_duration(), Duration::from_secs(900));
        assert_eq!(cfg.guard.rate_limits.for_role(Role::Client)[0].max_requests, 10);
        assert_eq!(cfg.aggregation.max_attempts, 3);
        assert_eq!(cfg.planner.faithful_level, Level::Mid);
    }

    #[test]
    fn backoff_doubles() {
        let cfg = AggregationConfig {
            backoff_base_ms: 100,
            ..AggregationConfig::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn file_overrides_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "utc_offset_minutes = -300\n\n[guard]\nlockout_threshold = 3\n\n[planner]\nfaithful_level = \"leaf\"\n"
        )
        .unwrap();
        let cfg = ConciergeConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.guard.lockout_threshold, 3);
        assert_eq!(cfg.guard.lockout_secs, 900);
        assert_eq!(cfg.planner.faithful_level, Level::Leaf);
        assert_eq!(cfg.utc_offset_minutes, -300);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ConciergeConfig::load_from(Path::new("/nonexistent/concierge.toml")).unwrap();
        assert_eq!(cfg.oracle.retries, 1);
    }
}
