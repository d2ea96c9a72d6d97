//! The request pipeline: guard → topic filter → router → planner/aggregation
//! and/or CRM → formatter.
//!
//! `submit` never fails outright. Authorization failures get one generic reply,
//! restricted topics get the fixed restricted reply, unresolvable intents get a
//! clarifying question, and partial data is answered with an explicit notice.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregation::{AggregatedResult, AggregationEngine};
use crate::audit::{AuditSink, DenialClass, MemoryAuditLog};
use crate::clock::{Clock, SystemClock};
use crate::config::ConciergeConfig;
use crate::crm::{CrmBackend, OperationResult, UnavailableCrm};
use crate::error::ConciergeError;
use crate::formatter::{Rendered, ResponseFormatter, Section};
use crate::guard::{AccessGuard, AuthorizedScope};
use crate::hierarchy::EntityTree;
use crate::identity::IdentityRegistry;
use crate::intent::{Capability, IntentOracle, KeywordOracle, StructuredIntent};
use crate::planner::QueryPlanner;
use crate::router::{Dispatch, DispatchKind, IntentRouter};
use crate::source::MetricSource;
use crate::topic::{TopicFilter, Verdict, RESTRICTED_REPLY};

/// Reply for every access denial, whatever the reason.
pub const GENERIC_DENIAL: &str = "Sorry, this number is not authorized to use this service.";

/// Reply when the request cannot be mapped to a capability.
pub const CLARIFY_REPLY: &str =
    "Sorry, I didn't catch that. You can ask things like \"how many sales today?\" or \"clicks by city this week\".";

enum CrmOutcome {
    Done(OperationResult),
    Denied,
    Failed,
}

pub struct Concierge {
    guard: AccessGuard,
    filter: Arc<TopicFilter>,
    router: IntentRouter,
    planner: QueryPlanner,
    engine: AggregationEngine,
    crm: Arc<dyn CrmBackend>,
    formatter: ResponseFormatter,
    tree: Arc<EntityTree>,
    clock: Arc<dyn Clock>,
}

pub struct ConciergeBuilder {
    registry: Arc<IdentityRegistry>,
    tree: Arc<EntityTree>,
    config: ConciergeConfig,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    oracle: Option<Arc<dyn IntentOracle>>,
    source: Option<Arc<dyn MetricSource>>,
    crm: Option<Arc<dyn CrmBackend>>,
    filter: Option<TopicFilter>,
}

impl ConciergeBuilder {
    pub fn config(mut self, config: ConciergeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn IntentOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn crm(mut self, crm: Arc<dyn CrmBackend>) -> Self {
        self.crm = Some(crm);
        self
    }

    pub fn topic_filter(mut self, filter: TopicFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Defaults: system clock at the configured offset, in-memory audit log, keyword
    /// oracle over the catalog's market names, no CRM. A metrics source is required.
    pub fn build(self) -> Result<Concierge, ConciergeError> {
        let source = self.source.ok_or(ConciergeError::MissingSource)?;
        let clock = self.clock.unwrap_or_else(|| {
            Arc::new(SystemClock::with_utc_offset_minutes(self.config.utc_offset_minutes))
        });
        let audit = self.audit.unwrap_or_else(|| Arc::new(MemoryAuditLog::new()));
        let oracle = self
            .oracle
            .unwrap_or_else(|| Arc::new(KeywordOracle::with_locations(self.tree.market_names())));
        let crm = self.crm.unwrap_or_else(|| Arc::new(UnavailableCrm));
        let filter = Arc::new(self.filter.unwrap_or_default());

        Ok(Concierge {
            guard: AccessGuard::new(self.registry, audit, clock.clone(), self.config.guard.clone()),
            router: IntentRouter::new(oracle, &self.config.oracle),
            planner: QueryPlanner::new(self.tree.clone(), self.config.planner.clone()),
            engine: AggregationEngine::new(source, self.tree.clone(), self.config.aggregation.clone()),
            formatter: ResponseFormatter::new(filter.clone(), self.tree.clone()),
            filter,
            crm,
            tree: self.tree,
            clock,
        })
    }
}

impl Concierge {
    pub fn builder(registry: Arc<IdentityRegistry>, tree: Arc<EntityTree>) -> ConciergeBuilder {
        ConciergeBuilder {
            registry,
            tree,
            config: ConciergeConfig::default(),
            clock: None,
            audit: None,
            oracle: None,
            source: None,
            crm: None,
            filter: None,
        }
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Answers one inbound message from `identity_key`.
    pub async fn submit(&self, identity_key: &str, text: &str) -> String {
        let requested = self.tree.mentioned_in(text);
        let scope = match self.guard.authorize(identity_key, &requested) {
            Ok(scope) => scope,
            Err(denied) => {
                debug!(target: "concierge::pipeline", reason = %denied, "Denied before routing");
                return GENERIC_DENIAL.to_string();
            }
        };

        if let Verdict::Restricted(class) = self.filter.classify(text) {
            info!(target: "concierge::topic", class = ?class, "Restricted topic refused");
            self.guard.record_denial(identity_key, DenialClass::Restricted);
            return RESTRICTED_REPLY.to_string();
        }

        let dispatch = match self.router.route(scope, text).await {
            Ok(dispatch) => dispatch,
            Err(e) => {
                debug!(target: "concierge::pipeline", error = %e, "Asking for clarification");
                return CLARIFY_REPLY.to_string();
            }
        };

        let rendered = match dispatch.kind {
            DispatchKind::Metrics => {
                let result = self.run_metrics(&dispatch).await;
                self.formatter.render(&[Section::Metrics(&result)], &dispatch.intent)
            }
            DispatchKind::Crm => match self.run_crm(identity_key, &dispatch.intent).await {
                CrmOutcome::Done(result) => self.formatter.render(&[Section::Crm(&result)], &dispatch.intent),
                CrmOutcome::Denied => return GENERIC_DENIAL.to_string(),
                CrmOutcome::Failed => self
                    .formatter
                    .render(&[Section::Unavailable(Capability::CrmOperation)], &dispatch.intent),
            },
            DispatchKind::Combined => {
                let (result, crm) = tokio::join!(
                    self.run_metrics(&dispatch),
                    self.run_crm(identity_key, &dispatch.intent)
                );
                let crm_section = match &crm {
                    CrmOutcome::Done(r) => Section::Crm(r),
                    CrmOutcome::Denied | CrmOutcome::Failed => Section::Unavailable(Capability::CrmOperation),
                };
                self.formatter
                    .render(&[Section::Metrics(&result), crm_section], &dispatch.intent)
            }
        };

        if let Rendered::Withheld(_) = rendered {
            self.guard.record_denial(identity_key, DenialClass::Restricted);
        }
        rendered.into_text()
    }

    async fn run_metrics(&self, dispatch: &Dispatch) -> AggregatedResult {
        let plans = self
            .planner
            .plan(&dispatch.intent, &dispatch.scope, self.clock.today());
        if plans.is_empty() {
            warn!(target: "concierge::pipeline", scope = ?scope_size(&dispatch.scope), "Scope holds no catalog entity");
        }
        self.engine.aggregate(&plans).await
    }

    async fn run_crm(&self, identity_key: &str, intent: &StructuredIntent) -> CrmOutcome {
        let Some(operation) = intent.crm.as_ref() else {
            return CrmOutcome::Failed;
        };
        if self
            .guard
            .check_permission(identity_key, operation.required_permission())
            .is_err()
        {
            return CrmOutcome::Denied;
        }
        match self.crm.execute(operation).await {
            Ok(result) => CrmOutcome::Done(result),
            Err(e) => {
                warn!(
                    target: "concierge::pipeline",
                    category = ?operation.category,
                    action = ?operation.action,
                    error = %e,
                    "CRM operation failed"
                );
                CrmOutcome::Failed
            }
        }
    }
}

fn scope_size(scope: &AuthorizedScope) -> Option<usize> {
    match scope {
        AuthorizedScope::All => None,
        AuthorizedScope::Entities(set) => Some(set.len()),
    }
}
