//! Concierge core library.
//! Access-controlled natural-language router for advertising metrics and CRM
//! operations: identity registry, access guard, topic filter, intent routing,
//! query planning, aggregation and response formatting.

pub mod aggregation;
pub mod audit;
pub mod clock;
pub mod concierge;
pub mod config;
pub mod crm;
pub mod error;
pub mod formatter;
pub mod guard;
pub mod hierarchy;
pub mod identity;
pub mod intent;
pub mod metrics;
pub mod planner;
pub mod router;
pub mod source;
pub mod topic;
pub mod window;

pub use aggregation::{AggregatedResult, AggregationEngine};
pub use audit::{AuditEntry, AuditOutcome, AuditSink, DenialClass, MemoryAuditLog, SledAuditLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concierge::{Concierge, ConciergeBuilder, CLARIFY_REPLY, GENERIC_DENIAL};
pub use config::ConciergeConfig;
pub use crm::{CrmAction, CrmBackend, CrmCategory, CrmOperation, OperationResult, UnavailableCrm};
pub use error::{AccessDenied, ConciergeError, CrmError, FetchError, OracleError, RouteError};
pub use formatter::ResponseFormatter;
pub use guard::{AccessGuard, AuthSession, AuthorizedScope};
pub use hierarchy::{EntityId, EntityTree, Level};
pub use identity::{normalize_phone, Identity, IdentityRegistry, Permission, Role, Scope};
pub use intent::{Capability, IntentOracle, KeywordOracle, Language, OracleReply, StructuredIntent};
pub use metrics::{FieldValues, MetricField};
pub use planner::{FetchPlan, QueryPlanner};
pub use router::{Dispatch, DispatchKind, IntentRouter};
pub use source::{Breakdown, MemoryMetricSource, MetricRecord, MetricRow, MetricSource};
pub use topic::{TopicClass, TopicFilter, Verdict, RESTRICTED_REPLY};
pub use window::{NamedWindow, TimeWindow};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
