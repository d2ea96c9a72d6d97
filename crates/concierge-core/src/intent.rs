//! Structured intent and the NL-understanding oracle seam.
//!
//! The oracle turns free text into a capability tag plus structured fields. It is
//! untrusted: it never decides scope, and anything it returns outside the offered
//! capability menu is ignored by the router.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::crm::CrmOperation;
use crate::error::OracleError;
use crate::metrics::MetricField;
use crate::window::find_time_signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MetricsQuery,
    CrmOperation,
}

/// Every capability the router can dispatch to.
pub const CAPABILITY_MENU: [Capability; 2] = [Capability::MetricsQuery, Capability::CrmOperation];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredIntent {
    #[serde(default)]
    pub metrics: Vec<MetricField>,
    /// Location filter, applied as a breakdown rather than an entity.
    #[serde(default)]
    pub location: Option<String>,
    /// Raw time phrase, resolved by the planner against the account calendar.
    #[serde(default)]
    pub time_signal: Option<String>,
    /// Caller asked for a full report.
    #[serde(default)]
    pub report: bool,
    /// Caller asked for a per-market list.
    #[serde(default)]
    pub by_market: bool,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub crm: Option<CrmOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleReply {
    pub capabilities: Vec<Capability>,
    pub intent: StructuredIntent,
}

#[async_trait]
pub trait IntentOracle: Send + Sync {
    /// `Ok(None)` means the text names no capability from `menu`.
    async fn interpret(&self, text: &str, menu: &[Capability]) -> Result<Option<OracleReply>, OracleError>;
}

static METRICS_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bperformance\b|\bresults?\b|\breport\b|\boverview\b|\bsummary\b|\binsights?\b|\bhow\s+(?:are|is)\s+(?:we|it|the)\b.*\bdoing\b|\bnumbers\b|\bstats\b|\brendimiento\b|\breporte\b|\bresumen\b",
    )
    .expect("static regex")
});

static REPORT_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\breport\b|\boverview\b|\bsummary\b|\ball\s+metrics\b|\bfull\s+breakdown\b|\breporte\b|\bresumen\b")
        .expect("static regex")
});

static MARKET_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bby\s+(?:city|market|location)\b|\b(?:each|every|per)\s+(?:city|market|location)\b|\b(?:all|which)\s+(?:cities|markets)\b|\bpor\s+(?:ciudad|mercado)\b",
    )
    .expect("static regex")
});

static SPANISH_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bcu[aá]nt[oa]s?\b|\bventas\b|\bhoy\b|\bayer\b|\bgasto\b|\bboletos\b|\brendimiento\b|\bpor\s+ciudad\b|\bmercado\b|\bqu[eé]\b|\bresumen\b",
    )
    .expect("static regex")
});

/// Rule-based oracle: keyword gating over metric names, CRM vocabulary, time
/// phrases and a list of known market names.
#[derive(Debug, Clone)]
pub struct KeywordOracle {
    locations: Vec<String>,
}

/// No known locations; location filters come from `with_locations`.
impl Default for KeywordOracle {
    fn default() -> Self {
        Self::with_locations(Vec::new())
    }
}

impl KeywordOracle {
    pub fn with_locations(locations: impl IntoIterator<Item = String>) -> Self {
        let mut locations: Vec<String> = locations.into_iter().filter(|l| !l.trim().is_empty()).collect();
        // Longest first so "San Diego" wins over a shorter overlapping name.
        locations.sort_by_key(|l| std::cmp::Reverse(l.len()));
        Self { locations }
    }

    fn find_location(&self, lower: &str) -> Option<String> {
        self.locations
            .iter()
            .find(|loc| {
                let needle = loc.to_lowercase();
                lower
                    .match_indices(&needle)
                    .any(|(i, _)| is_word_boundary(lower, i, needle.len()))
            })
            .cloned()
    }

    /// Interprets `text` without any I/O.
    pub fn parse(&self, text: &str, menu: &[Capability]) -> Option<OracleReply> {
        let lower = text.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }

        let metrics = MetricField::detect(&lower);
        let crm = CrmOperation::detect(text);
        let report = REPORT_HINTS.is_match(&lower);
        let by_market = MARKET_HINTS.is_match(&lower);
        let location = self.find_location(&lower);

        let mut capabilities = Vec::new();
        let wants_metrics = !metrics.is_empty() || report || by_market || METRICS_HINTS.is_match(&lower);
        if wants_metrics && menu.contains(&Capability::MetricsQuery) {
            capabilities.push(Capability::MetricsQuery);
        }
        if crm.is_some() && menu.contains(&Capability::CrmOperation) {
            capabilities.push(Capability::CrmOperation);
        }
        if capabilities.is_empty() {
            return None;
        }

        let language = if SPANISH_HINTS.is_match(&lower) {
            Language::Es
        } else {
            Language::En
        };

        Some(OracleReply {
            capabilities,
            intent: StructuredIntent {
                metrics,
                location,
                time_signal: find_time_signal(&lower),
                report,
                by_market,
                language,
                crm,
            },
        })
    }
}

fn is_word_boundary(text: &str, start: usize, len: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[start + len..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

#[async_trait]
impl IntentOracle for KeywordOracle {
    async fn interpret(&self, text: &str, menu: &[Capability]) -> Result<Option<OracleReply>, OracleError> {
        Ok(self.parse(text, menu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::CrmCategory;

    fn markets() -> KeywordOracle {
        KeywordOracle::with_locations(["Miami", "San", "San Diego"].map(String::from))
    }

    #[test]
    fn sales_today_is_a_metrics_query() {
        let reply = KeywordOracle::default()
            .parse("How many sales today?", &CAPABILITY_MENU)
            .unwrap();
        assert_eq!(reply.capabilities, vec![Capability::MetricsQuery]);
        assert_eq!(reply.intent.metrics, vec![MetricField::Sales]);
        assert_eq!(reply.intent.time_signal.as_deref(), Some("today"));
        assert_eq!(reply.intent.language, Language::En);
        assert!(reply.intent.crm.is_none());
    }

    #[test]
    fn location_and_market_list() {
        let oracle = markets();
        let reply = oracle.parse("clicks in San Diego last week", &CAPABILITY_MENU).unwrap();
        assert_eq!(reply.intent.location.as_deref(), Some("San Diego"));

        let reply = oracle.parse("sales by city", &CAPABILITY_MENU).unwrap();
        assert!(reply.intent.by_market);
        assert!(reply.intent.location.is_none());
    }

    #[test]
    fn converted_leads_hit_both_capabilities() {
        let reply = KeywordOracle::default()
            .parse("how many leads converted this week", &CAPABILITY_MENU)
            .unwrap();
        assert_eq!(
            reply.capabilities,
            vec![Capability::MetricsQuery, Capability::CrmOperation]
        );
        assert_eq!(reply.intent.crm.map(|op| op.category), Some(CrmCategory::Opportunities));
    }

    #[test]
    fn respects_menu_and_unknown_text() {
        let oracle = KeywordOracle::default();
        assert!(oracle.parse("send a message to Ana", &[Capability::MetricsQuery]).is_none());
        assert!(oracle.parse("what's the weather like", &CAPABILITY_MENU).is_none());
        assert!(oracle.parse("   ", &CAPABILITY_MENU).is_none());
    }

    #[test]
    fn spanish_requests_are_tagged() {
        let reply = markets()
            .parse("¿Cuántas ventas hoy en Miami?", &CAPABILITY_MENU)
            .unwrap();
        assert_eq!(reply.intent.language, Language::Es);
        assert_eq!(reply.intent.location.as_deref(), Some("Miami"));
        assert_eq!(reply.intent.time_signal.as_deref(), Some("hoy"));
    }

    #[test]
    fn default_knows_no_locations() {
        let reply = KeywordOracle::default()
            .parse("sales in Miami today", &CAPABILITY_MENU)
            .unwrap();
        assert!(reply.intent.location.is_none());
    }

    #[test]
    fn location_needs_word_boundaries() {
        let oracle = KeywordOracle::with_locations(vec!["Tampa".to_string()]);
        let reply = oracle.parse("sales for tampax", &CAPABILITY_MENU).unwrap();
        assert!(reply.intent.location.is_none());
    }
}
