//! Intent router: asks the oracle for a capability tag and picks the dispatch
//! target. Scope always comes from the Access Guard, never from the oracle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::{OracleError, RouteError};
use crate::guard::AuthorizedScope;
use crate::intent::{Capability, IntentOracle, OracleReply, StructuredIntent, CAPABILITY_MENU};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Metrics,
    Crm,
    /// Both capabilities; the halves run concurrently.
    Combined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub kind: DispatchKind,
    pub intent: StructuredIntent,
    pub scope: AuthorizedScope,
}

pub struct IntentRouter {
    oracle: Arc<dyn IntentOracle>,
    timeout: Duration,
    retries: u32,
}

impl IntentRouter {
    pub fn new(oracle: Arc<dyn IntentOracle>, config: &OracleConfig) -> Self {
        Self {
            oracle,
            timeout: config.timeout(),
            retries: config.retries,
        }
    }

    pub async fn route(&self, scope: AuthorizedScope, text: &str) -> Result<Dispatch, RouteError> {
        let reply = self.ask(text).await?;
        let kind = Self::dispatch_kind(&reply).ok_or(RouteError::IntentUnresolved)?;
        debug!(target: "concierge::pipeline", kind = ?kind, "Request routed");
        Ok(Dispatch {
            kind,
            intent: reply.intent,
            scope,
        })
    }

    /// Calls the oracle with one timeout per attempt. Timeouts and transient errors
    /// are retried; anything else resolves to `IntentUnresolved`.
    async fn ask(&self, text: &str) -> Result<OracleReply, RouteError> {
        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            let call = tokio::time::timeout(self.timeout, self.oracle.interpret(text, &CAPABILITY_MENU)).await;
            match call {
                Ok(Ok(Some(reply))) => return Ok(reply),
                Ok(Ok(None)) => {
                    debug!(target: "concierge::pipeline", "Oracle found no capability");
                    return Err(RouteError::IntentUnresolved);
                }
                Ok(Err(OracleError::Permanent(reason))) => {
                    warn!(target: "concierge::pipeline", reason = %reason, "Oracle failed");
                    return Err(RouteError::IntentUnresolved);
                }
                Ok(Err(OracleError::Transient(reason))) => {
                    warn!(target: "concierge::pipeline", attempt, reason = %reason, "Oracle transient failure");
                }
                Err(_) => {
                    warn!(
                        target: "concierge::pipeline",
                        attempt,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Oracle timed out"
                    );
                }
            }
        }
        Err(RouteError::IntentUnresolved)
    }

    /// Capabilities outside the menu are ignored; a CRM tag without an operation is
    /// not actionable.
    fn dispatch_kind(reply: &OracleReply) -> Option<DispatchKind> {
        let tags: BTreeSet<Capability> = reply
            .capabilities
            .iter()
            .copied()
            .filter(|c| CAPABILITY_MENU.contains(c))
            .filter(|c| *c != Capability::CrmOperation || reply.intent.crm.is_some())
            .collect();
        match (
            tags.contains(&Capability::MetricsQuery),
            tags.contains(&Capability::CrmOperation),
        ) {
            (true, true) => Some(DispatchKind::Combined),
            (true, false) => Some(DispatchKind::Metrics),
            (false, true) => Some(DispatchKind::Crm),
            (false, false) => None,
        }
    }
}
