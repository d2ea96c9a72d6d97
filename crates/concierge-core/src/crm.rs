//! CRM dispatch target: contacts, conversations, calendars, opportunities and
//! payments. The backend is an external system; this module owns the operation
//! vocabulary, the permission each operation needs, and the backend seam.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::identity::Permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmCategory {
    Contacts,
    Conversations,
    Calendars,
    Opportunities,
    Payments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmAction {
    Get,
    Search,
    List,
    Create,
    AddTag,
    Send,
    Update,
    Delete,
    RemoveTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmOperation {
    pub category: CrmCategory,
    pub action: CrmAction,
    /// Free-form arguments passed through to the backend.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub summary: String,
    #[serde(default)]
    pub count: Option<u64>,
}

static CATEGORY_PATTERNS: Lazy<Vec<(CrmCategory, Regex)>> = Lazy::new(|| {
    [
        (CrmCategory::Opportunities, r"\bopportunit(?:y|ies)\b|\bpipelines?\b|\bdeals?\b|\bleads?\s+(?:converted|conversion)|\bconverted\b"),
        (CrmCategory::Payments, r"\bpayments?\b|\btransactions?\b|\binvoices?\b|\borders?\b|\bpagos?\b"),
        (CrmCategory::Calendars, r"\bappointments?\b|\bcalendars?\b|\bbookings?\b|\bcitas?\b"),
        (CrmCategory::Conversations, r"\bmessages?\b|\bconversations?\b|\bsms\b|\btext\s+(?:message|to)\b|\bmensajes?\b"),
        (CrmCategory::Contacts, r"\bcontacts?\b|\btags?\b|\bcontactos?\b"),
    ]
    .into_iter()
    .map(|(c, p)| (c, Regex::new(&format!("(?i){p}")).expect("static regex")))
    .collect()
});

static ACTION_PATTERNS: Lazy<Vec<(CrmAction, Regex)>> = Lazy::new(|| {
    [
        (CrmAction::RemoveTag, r"\bremove\s+(?:the\s+)?tags?\b|\buntag\b"),
        (CrmAction::AddTag, r"\b(?:add\s+(?:a\s+|the\s+)?)?tag\b"),
        (CrmAction::Send, r"\bsend\b|\benviar?\b"),
        (CrmAction::Delete, r"\bdelete\b|\bremove\b|\bcancel\b"),
        (CrmAction::Update, r"\bupdate\b|\bedit\b|\bchange\b|\breschedule\b"),
        (CrmAction::Create, r"\bcreate\b|\badd\b|\bnew\b|\bbook\b|\bschedule\b"),
        (CrmAction::Search, r"\bsearch\b|\bfind\b|\blook\s*up\b|\bbuscar\b"),
        (CrmAction::List, r"\blist\b|\bhow\s+many\b|\bshow\b|\ball\b|\bcu[aá]nt[oa]s\b"),
    ]
    .into_iter()
    .map(|(a, p)| (a, Regex::new(&format!("(?i){p}")).expect("static regex")))
    .collect()
});

impl CrmAction {
    /// Permission an identity needs to run this action.
    pub fn required_permission(&self) -> Permission {
        match self {
            CrmAction::Get | CrmAction::Search | CrmAction::List => Permission::Read,
            CrmAction::Create | CrmAction::AddTag => Permission::Write,
            CrmAction::Send => Permission::Send,
            CrmAction::Update => Permission::Update,
            CrmAction::Delete | CrmAction::RemoveTag => Permission::Delete,
        }
    }
}

impl CrmOperation {
    pub fn new(category: CrmCategory, action: CrmAction) -> Self {
        Self {
            category,
            action,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn required_permission(&self) -> Permission {
        self.action.required_permission()
    }

    /// CRM operation named in free text, if any. The raw text is passed along as the
    /// `query` parameter.
    pub fn detect(text: &str) -> Option<CrmOperation> {
        let category = CATEGORY_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(c, _)| *c)?;
        let action = ACTION_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(a, _)| *a)
            .unwrap_or(CrmAction::Get);
        Some(CrmOperation {
            category,
            action,
            parameters: serde_json::json!({ "query": text.trim() }),
        })
    }
}

#[async_trait]
pub trait CrmBackend: Send + Sync {
    async fn execute(&self, operation: &CrmOperation) -> Result<OperationResult, CrmError>;
}

/// Backend used when no CRM is configured; every operation reports unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableCrm;

#[async_trait]
impl CrmBackend for UnavailableCrm {
    async fn execute(&self, operation: &CrmOperation) -> Result<OperationResult, CrmError> {
        tracing::debug!(
            target: "concierge::pipeline",
            category = ?operation.category,
            action = ?operation.action,
            "No CRM backend configured"
        );
        Err(CrmError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_category_and_action() {
        let op = CrmOperation::detect("send a message to Maria").unwrap();
        assert_eq!((op.category, op.action), (CrmCategory::Conversations, CrmAction::Send));
        assert_eq!(op.required_permission(), Permission::Send);

        let op = CrmOperation::detect("how many leads converted this week").unwrap();
        assert_eq!((op.category, op.action), (CrmCategory::Opportunities, CrmAction::List));

        let op = CrmOperation::detect("remove the tag vip from this contact").unwrap();
        assert_eq!((op.category, op.action), (CrmCategory::Contacts, CrmAction::RemoveTag));
        assert_eq!(op.required_permission(), Permission::Delete);

        let op = CrmOperation::detect("book an appointment for Friday").unwrap();
        assert_eq!((op.category, op.action), (CrmCategory::Calendars, CrmAction::Create));
        assert_eq!(op.parameters["query"], "book an appointment for Friday");
    }

    #[test]
    fn plain_metrics_text_is_not_crm() {
        assert!(CrmOperation::detect("how many sales today").is_none());
        assert!(CrmOperation::detect("how many leads this week").is_none());
    }

    #[test]
    fn read_actions_need_read() {
        for action in [CrmAction::Get, CrmAction::Search, CrmAction::List] {
            assert_eq!(action.required_permission(), Permission::Read);
        }
        assert_eq!(CrmAction::AddTag.required_permission(), Permission::Write);
        assert_eq!(CrmAction::Update.required_permission(), Permission::Update);
    }

    #[tokio::test]
    async fn unavailable_backend_reports_unavailable() {
        let op = CrmOperation::new(CrmCategory::Contacts, CrmAction::List);
        assert_eq!(UnavailableCrm.execute(&op).await, Err(CrmError::Unavailable));
    }
}
