//! Time windows: resolving a caller's time phrase into a concrete window.
//!
//! A request with no time signal resolves to the all-time window. "Today" and
//! "yesterday" stay named so the data source applies its own account calendar;
//! relative spans ("last 7 days", "this month") resolve to explicit date ranges
//! against the reference date.

use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::intent::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedWindow {
    Today,
    Yesterday,
    AllTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Named(NamedWindow),
    /// Inclusive on both ends.
    Range { from: NaiveDate, to: NaiveDate },
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow::Named(NamedWindow::AllTime)
    }
}

static EXPLICIT_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:from|between|desde)\s+(\d{4}-\d{2}-\d{2})\s+(?:to|and|until|hasta|-)\s+(\d{4}-\d{2}-\d{2})\b")
        .expect("static regex")
});

static SIGNALS: Lazy<Vec<(Signal, Regex)>> = Lazy::new(|| {
    [
        (Signal::Yesterday, r"\byesterday\b|\bayer\b"),
        (Signal::Today, r"\btoday\b|\btonight\b|\bhoy\b"),
        (Signal::Last7, r"\blast\s+7\s+days\b|\bpast\s+7\s+days\b|\blast\s+week\b|\bpast\s+week\b|\bthis\s+week\b|\besta\s+semana\b|\bsemana\s+pasada\b"),
        (Signal::Last30, r"\blast\s+30\s+days\b|\bpast\s+30\s+days\b|\bpast\s+month\b"),
        (Signal::LastMonth, r"\blast\s+month\b|\bmes\s+pasado\b"),
        (Signal::ThisMonth, r"\bthis\s+month\b|\beste\s+mes\b"),
        (Signal::AllTime, r"\ball[\s-]+time\b|\btotal\b|\boverall\b|\bso\s+far\b|\blifetime\b|\ben\s+total\b"),
    ]
    .into_iter()
    .map(|(signal, pattern)| {
        let re = Regex::new(&format!("(?i){pattern}")).expect("static regex");
        (signal, re)
    })
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Yesterday,
    Today,
    Last7,
    Last30,
    LastMonth,
    ThisMonth,
    AllTime,
}

/// The time phrase found in `text`, if any. Explicit ranges win over named phrases.
pub fn find_time_signal(text: &str) -> Option<String> {
    if let Some(m) = EXPLICIT_RANGE.find(text) {
        return Some(m.as_str().to_string());
    }
    SIGNALS
        .iter()
        .find_map(|(_, re)| re.find(text))
        .map(|m| m.as_str().to_string())
}

impl TimeWindow {
    /// Resolves a time phrase against `today`. Unrecognized or empty phrases yield all time.
    pub fn resolve(signal: &str, today: NaiveDate) -> TimeWindow {
        if let Some(caps) = EXPLICIT_RANGE.captures(signal) {
            let from = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d");
            let to = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d");
            if let (Ok(a), Ok(b)) = (from, to) {
                let (from, to) = if a <= b { (a, b) } else { (b, a) };
                return TimeWindow::Range { from, to };
            }
        }

        let signal = SIGNALS
            .iter()
            .find(|(_, re)| re.is_match(signal))
            .map(|(s, _)| *s)
            .unwrap_or(Signal::AllTime);

        match signal {
            Signal::Today => TimeWindow::Named(NamedWindow::Today),
            Signal::Yesterday => TimeWindow::Named(NamedWindow::Yesterday),
            Signal::AllTime => TimeWindow::Named(NamedWindow::AllTime),
            Signal::Last7 => TimeWindow::Range {
                from: today - Duration::days(6),
                to: today,
            },
            Signal::Last30 => TimeWindow::Range {
                from: today - Duration::days(29),
                to: today,
            },
            Signal::ThisMonth => TimeWindow::Range {
                from: today.with_day(1).unwrap_or(today),
                to: today,
            },
            Signal::LastMonth => {
                let first_this = today.with_day(1).unwrap_or(today);
                let last_prev = first_this - Duration::days(1);
                TimeWindow::Range {
                    from: last_prev.with_day(1).unwrap_or(last_prev),
                    to: last_prev,
                }
            }
        }
    }

    /// Inclusive date bounds; `None` for all time.
    pub fn bounds(&self, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        match self {
            TimeWindow::Named(NamedWindow::Today) => Some((today, today)),
            TimeWindow::Named(NamedWindow::Yesterday) => {
                let y = today - Duration::days(1);
                Some((y, y))
            }
            TimeWindow::Named(NamedWindow::AllTime) => None,
            TimeWindow::Range { from, to } => Some((*from, *to)),
        }
    }

    pub fn contains(&self, date: NaiveDate, today: NaiveDate) -> bool {
        match self.bounds(today) {
            None => true,
            Some((from, to)) => from <= date && date <= to,
        }
    }

    /// Phrase appended to an answer, e.g. "today" or "(all time)".
    pub fn label(&self, lang: Language) -> String {
        match (self, lang) {
            (TimeWindow::Named(NamedWindow::Today), Language::En) => "today".into(),
            (TimeWindow::Named(NamedWindow::Today), Language::Es) => "hoy".into(),
            (TimeWindow::Named(NamedWindow::Yesterday), Language::En) => "yesterday".into(),
            (TimeWindow::Named(NamedWindow::Yesterday), Language::Es) => "ayer".into(),
            (TimeWindow::Named(NamedWindow::AllTime), Language::En) => "(all time)".into(),
            (TimeWindow::Named(NamedWindow::AllTime), Language::Es) => "(todo el periodo)".into(),
            (TimeWindow::Range { from, to }, Language::En) => format!("({from} to {to})"),
            (TimeWindow::Range { from, to }, Language::Es) => format!("({from} a {to})"),
        }
    }
}
