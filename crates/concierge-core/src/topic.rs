//! Topic filter: refuses questions about how the campaigns are run.
//!
//! Callers may ask for results (sales, spend, clicks and the like) but never about
//! internal process, proprietary methods, strategy or optimization, calculation
//! logic, or requests to change campaigns. The same filter screens composed answers
//! before they leave the pipeline.
//!
//! Extra protected terms can be loaded from a file (one term per line; empty lines
//! and lines starting with `#` ignored). They are classed as proprietary methods.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::BufRead;
use std::path::Path;

/// Reply sent for every restricted request. Deliberately silent about which rule fired.
pub const RESTRICTED_REPLY: &str =
    "I can share your campaign results, like sales, spend, clicks and impressions. What would you like to know?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicClass {
    InternalProcess,
    ProprietaryMethod,
    StrategyOptimization,
    AlgorithmDetail,
    ModificationIntent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Restricted(TopicClass),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

const INTERNAL_PROCESS: &[&str] = &[
    r"\binternal\b",
    r"\bagenc(?:y|ies)\b",
    r"\bprocess(?:es)?\b",
    r"\bhow\s+do\s+you\b",
    r"\bhow\s+are\s+you\b",
    r"\bhow\s+does\b",
    r"\bwhen\s+do\s+you\b",
    r"\bhow\s+often\s+do\s+you\b",
    r"\bwhat(?:'s|\s+is)\s+your\b",
    r"\bstructur(?:e|ed|es|ing)\b",
    r"\bset\s*up\b",
    r"\bupdate\s+schedule\b",
    r"\bhow\s+many\s+(?:campaigns|ad\s*sets|adsets)\s+do\s+you\b",
    r"\bhow\s+many\s+campaigns\b",
    r"\bhow\s+(?:was|were|is|are)\s+(?:this|the|these|our)\s+\w+\s+(?:created|made|built)\b",
    r"\bproceso\b",
];

const PROPRIETARY_METHOD: &[&str] = &[
    r"\bproprietary\b",
    r"\bsecret\b",
    r"\bconfidential\b",
    r"\bmethod(?:s|ology)?\b",
    r"\b(?:how|what|why|explain|show)\b[^.?!]*?\b(?:method|process|strateg|technique|approach|system)",
    r"\bapproach(?:es)?\b",
    r"\bsystems?\b",
    r"\bdo\s+you\s+use\b",
    r"\btechniques?\b",
    r"\bad\s+copy\b",
    r"\bcreatives?\b",
    r"\bwhat\s+images\b",
    r"\bsecreto\b",
];

const STRATEGY_OPTIMIZATION: &[&str] = &[
    r"\boptimi[sz](?:e|es|ed|ing|ation|ations)\b",
    r"\bstrateg(?:y|ies|ic)\b",
    r"\bbid(?:s|ding)?\b",
    r"\brecommend(?:s|ed|ation|ations)?\b",
    r"\bbest\s+practices?\b",
    r"\bimprove\b",
    r"\bwhat\s+should\s+(?:we|i)\b",
    r"\bwhy\s+did\s+you\b",
    r"\btarget(?:ing)?\s+audiences?\b",
    r"\btargeting\b",
    r"\bestrategia\b",
    r"\boptimiza",
];

const ALGORITHM_DETAIL: &[&str] = &[
    r"\balgorithms?\b",
    r"\bformulas?\b",
    r"\bcalculat(?:e|ed|es|ing|ion|ions)\b",
    r"\blogic\b",
    r"\balgoritmo\b",
];

const MODIFICATION_INTENT: &[&str] = &[
    r"\b(?:pause|unpause|resume|stop|turn\s+off|turn\s+on|change|update|increase|decrease|raise|lower|adjust|modify|edit|create|delete|launch|duplicate|boost|cambiar|pausar)\b[^.?!]{0,40}?\b(?:budgets?|campaigns?|ads?|ad\s*sets?|adsets?|bids?|targeting|audiences?|creatives?|presupuesto|campa[ñn]as?)\b",
];

/// Classifies text against the restricted topic classes.
#[derive(Debug)]
pub struct TopicFilter {
    rules: Vec<(TopicClass, Regex)>,
    terms: Vec<String>,
    /// Compiled alternation of the extra protected terms.
    extra: Option<Regex>,
}

impl Default for TopicFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicFilter {
    pub fn new() -> Self {
        let groups: [(TopicClass, &[&str]); 5] = [
            (TopicClass::ModificationIntent, MODIFICATION_INTENT),
            (TopicClass::StrategyOptimization, STRATEGY_OPTIMIZATION),
            (TopicClass::AlgorithmDetail, ALGORITHM_DETAIL),
            (TopicClass::ProprietaryMethod, PROPRIETARY_METHOD),
            (TopicClass::InternalProcess, INTERNAL_PROCESS),
        ];
        let rules = groups
            .into_iter()
            .filter_map(|(class, patterns)| {
                let pattern = format!("(?i)(?:{})", patterns.join("|"));
                match Regex::new(&pattern) {
                    Ok(re) => Some((class, re)),
                    Err(e) => {
                        tracing::error!(target: "concierge::topic", class = ?class, error = %e, "Topic rule failed to compile");
                        None
                    }
                }
            })
            .collect();
        Self {
            rules,
            terms: Vec::new(),
            extra: None,
        }
    }

    /// Filter with additional protected terms.
    pub fn with_terms(terms: Vec<String>) -> Self {
        let mut filter = Self::new();
        filter.add_terms(terms);
        filter
    }

    /// Merge protected terms from a file. A missing file adds nothing.
    pub fn merge_terms_from_path(&mut self, path: &Path) -> std::io::Result<()> {
        let extra = Self::read_terms_from_path(path)?;
        let added = extra.len();
        self.add_terms(extra);
        tracing::info!(target: "concierge::topic", path = %path.display(), added, "Protected terms merged");
        Ok(())
    }

    fn add_terms(&mut self, terms: Vec<String>) {
        self.terms.extend(
            terms
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        );
        self.rebuild_extra();
    }

    fn rebuild_extra(&mut self) {
        if self.terms.is_empty() {
            self.extra = None;
            return;
        }
        let escaped: Vec<String> = self.terms.iter().map(|t| regex::escape(t)).collect();
        let pattern_str = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
        self.extra = Regex::new(&pattern_str).ok();
    }

    pub fn read_terms_from_path(path: &Path) -> std::io::Result<Vec<String>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let f = fs::File::open(path)?;
        let mut terms = Vec::new();
        for line in std::io::BufReader::new(f).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            terms.push(line.to_string());
        }
        Ok(terms)
    }

    pub fn classify(&self, text: &str) -> Verdict {
        if let Some((class, _)) = self.rules.iter().find(|(_, re)| re.is_match(text)) {
            return Verdict::Restricted(*class);
        }
        if self.extra.as_ref().is_some_and(|re| re.is_match(text)) {
            return Verdict::Restricted(TopicClass::ProprietaryMethod);
        }
        Verdict::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESTRICTED: &[&str] = &[
        "How is the campaign structured?",
        "Show me the campaign structure",
        "How many campaigns do we have?",
        "How was this campaign created?",
        "How are you optimizing the campaign?",
        "What's your bidding strategy?",
        "How do you target audiences?",
        "Why did you choose these cities?",
        "When do you update budgets?",
        "How often do you adjust bids?",
        "What's the update schedule?",
        "What does the ad copy say?",
        "Show me the creative content",
        "What images are you using?",
        "Update the budget to $5000",
        "Can you change the targeting?",
        "Pause the Miami campaign",
        "Create a new ad",
        "What should we do to improve?",
        "Give me recommendations",
        "How to improve performance?",
        "What's the best practice?",
        "How is tracking set up?",
        "Show me internal processes",
        "What's your proprietary method?",
        "how do you optimize the budget",
        "What formula do you use for ROAS?",
        "Explain your approach",
        "What system do you use to pick audiences?",
        "Which agency runs this campaign?",
        "How does the campaign decide who sees the ads?",
        "What targeting do you use?",
        "Show me how the process works",
        "What kind of approach works for Miami?",
    ];

    const ALLOWED: &[&str] = &[
        "How many sales today?",
        "Show me Miami performance",
        "What's the ROAS for Orlando?",
        "Show me clicks by city",
        "How many ads are in the campaign?",
        "What's the CTR for each ad?",
        "Show me ad performance metrics",
        "How much did we spend today?",
        "What's the CTR for this week?",
        "Show me last month's performance",
        "Show me impressions for all cities",
        "What's the total ad spend?",
        "Show me all available insights",
        "How many leads converted this week",
        "Send a message to Maria",
        "Update the contact phone for Ana",
        "¿Cuántas ventas hoy?",
    ];

    #[test]
    fn restricted_phrases_are_refused() {
        let filter = TopicFilter::new();
        for phrase in RESTRICTED {
            assert!(
                matches!(filter.classify(phrase), Verdict::Restricted(_)),
                "expected restricted: {phrase}"
            );
        }
    }

    #[test]
    fn results_questions_pass() {
        let filter = TopicFilter::new();
        for phrase in ALLOWED {
            assert_eq!(filter.classify(phrase), Verdict::Allowed, "expected allowed: {phrase}");
        }
    }

    #[test]
    fn classes_are_reported() {
        let filter = TopicFilter::new();
        assert_eq!(
            filter.classify("Pause the Miami campaign"),
            Verdict::Restricted(TopicClass::ModificationIntent)
        );
        assert_eq!(
            filter.classify("explain the algorithm"),
            Verdict::Restricted(TopicClass::AlgorithmDetail)
        );
        assert_eq!(
            filter.classify("optimise it"),
            Verdict::Restricted(TopicClass::StrategyOptimization)
        );
    }

    #[test]
    fn method_and_agency_questions_are_classed() {
        let filter = TopicFilter::new();
        assert_eq!(
            filter.classify("Explain your approach"),
            Verdict::Restricted(TopicClass::ProprietaryMethod)
        );
        assert_eq!(
            filter.classify("why is that the strategic choice"),
            Verdict::Restricted(TopicClass::StrategyOptimization)
        );
        assert_eq!(
            filter.classify("Which agency runs this campaign?"),
            Verdict::Restricted(TopicClass::InternalProcess)
        );
        assert_eq!(
            filter.classify("How does the campaign decide who sees the ads?"),
            Verdict::Restricted(TopicClass::InternalProcess)
        );
        assert_eq!(
            filter.classify("What targeting do you use?"),
            Verdict::Restricted(TopicClass::StrategyOptimization)
        );
    }

    #[test]
    fn reply_does_not_trip_the_filter() {
        let filter = TopicFilter::new();
        assert_eq!(filter.classify(RESTRICTED_REPLY), Verdict::Allowed);
        assert!(!RESTRICTED_REPLY.to_lowercase().contains("optimiz"));
    }

    #[test]
    fn extra_terms_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protected_terms.txt");
        std::fs::write(&path, "# vendor names\nLookalike Stack\n\n").unwrap();
        let mut filter = TopicFilter::new();
        filter.merge_terms_from_path(&path).unwrap();
        assert_eq!(
            filter.classify("tell me about the lookalike stack"),
            Verdict::Restricted(TopicClass::ProprietaryMethod)
        );
        filter.merge_terms_from_path(&dir.path().join("missing.txt")).unwrap();
        assert_eq!(filter.classify("sales today"), Verdict::Allowed);
    }
}
