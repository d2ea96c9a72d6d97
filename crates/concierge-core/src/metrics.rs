//! Metric fields and their combination rules.
//!
//! Counting metrics add across disjoint entities. Rate and ratio metrics are never
//! added: they are recomputed from the summed counting inputs, so combining them is
//! a pure function of the already-combined base values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::intent::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Sales,
    Revenue,
    Spend,
    Impressions,
    Clicks,
    Leads,
    Ctr,
    Cpc,
    Cpm,
    Roas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counting,
    Rate,
    Ratio,
}

/// Values keyed by field. Used for raw records and combined results alike.
pub type FieldValues = BTreeMap<MetricField, f64>;

/// Fields shown in a full report and used when a request names no metric.
pub const REPORT_FIELDS: [MetricField; 7] = [
    MetricField::Sales,
    MetricField::Revenue,
    MetricField::Spend,
    MetricField::Impressions,
    MetricField::Clicks,
    MetricField::Ctr,
    MetricField::Roas,
];

static FIELD_PATTERNS: Lazy<Vec<(MetricField, Regex)>> = Lazy::new(|| {
    [
        (MetricField::Ctr, r"\bctr\b|click[\s-]?through"),
        (MetricField::Cpc, r"\bcpc\b|cost\s+per\s+click"),
        (MetricField::Cpm, r"\bcpm\b|cost\s+per\s+(?:thousand|mille)"),
        (MetricField::Roas, r"\broas\b|return\s+on\s+ad\s+spend"),
        (MetricField::Sales, r"\bsales?\b|\bsold\b|\btickets?\b|\bpurchases?\b|\bventas?\b|\bboletos?\b|\bvendi"),
        (MetricField::Revenue, r"\brevenue\b|\bincome\b|\bingresos?\b"),
        (MetricField::Spend, r"\bspen[dt]\b|\bspending\b|\bcost\b|\bgast[oóa]"),
        (MetricField::Impressions, r"\bimpressions?\b|\bimpresiones\b"),
        (MetricField::Clicks, r"\bclicks?\b|\bclics?\b"),
        (MetricField::Leads, r"\bleads?\b|\bprospectos?\b"),
    ]
    .into_iter()
    .map(|(field, pattern)| {
        let re = Regex::new(&format!("(?i){pattern}")).expect("static regex");
        (field, re)
    })
    .collect()
});

/// Phrases that mention a counting word only as part of a derived metric's name.
static DERIVED_PHRASES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)cost\s+per\s+(?:click|thousand|mille)|return\s+on\s+ad\s+spend|click[\s-]?through")
        .expect("static regex")
});

impl MetricField {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricField::Sales
            | MetricField::Revenue
            | MetricField::Spend
            | MetricField::Impressions
            | MetricField::Clicks
            | MetricField::Leads => MetricKind::Counting,
            MetricField::Ctr | MetricField::Cpc | MetricField::Cpm => MetricKind::Rate,
            MetricField::Roas => MetricKind::Ratio,
        }
    }

    /// Counting fields this field is computed from (itself for counting fields).
    pub fn inputs(&self) -> &'static [MetricField] {
        match self {
            MetricField::Sales => &[MetricField::Sales],
            MetricField::Revenue => &[MetricField::Revenue],
            MetricField::Spend => &[MetricField::Spend],
            MetricField::Impressions => &[MetricField::Impressions],
            MetricField::Clicks => &[MetricField::Clicks],
            MetricField::Leads => &[MetricField::Leads],
            MetricField::Ctr => &[MetricField::Clicks, MetricField::Impressions],
            MetricField::Cpc => &[MetricField::Spend, MetricField::Clicks],
            MetricField::Cpm => &[MetricField::Spend, MetricField::Impressions],
            MetricField::Roas => &[MetricField::Revenue, MetricField::Spend],
        }
    }

    pub fn is_counting(&self) -> bool {
        self.kind() == MetricKind::Counting
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Sales => "sales",
            MetricField::Revenue => "revenue",
            MetricField::Spend => "spend",
            MetricField::Impressions => "impressions",
            MetricField::Clicks => "clicks",
            MetricField::Leads => "leads",
            MetricField::Ctr => "ctr",
            MetricField::Cpc => "cpc",
            MetricField::Cpm => "cpm",
            MetricField::Roas => "roas",
        }
    }

    /// Heading used in reports and market lists.
    pub fn title(&self, lang: Language) -> &'static str {
        match (self, lang) {
            (MetricField::Sales, Language::En) => "Sales",
            (MetricField::Sales, Language::Es) => "Ventas",
            (MetricField::Revenue, Language::En) => "Revenue",
            (MetricField::Revenue, Language::Es) => "Ingresos",
            (MetricField::Spend, Language::En) => "Spend",
            (MetricField::Spend, Language::Es) => "Gasto",
            (MetricField::Impressions, Language::En) => "Impressions",
            (MetricField::Impressions, Language::Es) => "Impresiones",
            (MetricField::Clicks, Language::En) => "Clicks",
            (MetricField::Clicks, Language::Es) => "Clics",
            (MetricField::Leads, Language::En) => "Leads",
            (MetricField::Leads, Language::Es) => "Prospectos",
            (MetricField::Ctr, _) => "CTR",
            (MetricField::Cpc, _) => "CPC",
            (MetricField::Cpm, _) => "CPM",
            (MetricField::Roas, _) => "ROAS",
        }
    }

    /// Fields named in free text, in declaration order.
    pub fn detect(text: &str) -> Vec<MetricField> {
        let stripped = DERIVED_PHRASES.replace_all(text, " ");
        let mut found: BTreeSet<MetricField> = BTreeSet::new();
        for (field, re) in FIELD_PATTERNS.iter() {
            let haystack = if field.is_counting() { stripped.as_ref() } else { text };
            if re.is_match(haystack) {
                found.insert(*field);
            }
        }
        found.into_iter().collect()
    }
}

/// Counting inputs needed to answer `fields`.
pub fn expand_inputs<'a>(fields: impl IntoIterator<Item = &'a MetricField>) -> BTreeSet<MetricField> {
    fields
        .into_iter()
        .flat_map(|f| f.inputs().iter().copied())
        .collect()
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0).then(|| numerator / denominator)
}

/// Combined value of `field` given already-summed counting values.
///
/// Counting fields read straight from `sums` (absent means zero). Rate and ratio
/// fields are recomputed from their inputs and are `None` when an input is absent
/// or the denominator is zero.
pub fn combine(field: MetricField, sums: &FieldValues) -> Option<f64> {
    let get = |f: MetricField| sums.get(&f).copied();
    match field.kind() {
        MetricKind::Counting => Some(get(field).unwrap_or(0.0)),
        MetricKind::Rate | MetricKind::Ratio => {
            let (n, d) = match field {
                MetricField::Ctr => (get(MetricField::Clicks)?, get(MetricField::Impressions)?),
                MetricField::Cpc => (get(MetricField::Spend)?, get(MetricField::Clicks)?),
                MetricField::Cpm => (get(MetricField::Spend)?, get(MetricField::Impressions)?),
                MetricField::Roas => (get(MetricField::Revenue)?, get(MetricField::Spend)?),
                _ => return None,
            };
            let scale = match field {
                MetricField::Ctr => 100.0,
                MetricField::Cpm => 1000.0,
                _ => 1.0,
            };
            ratio(n, d).map(|r| r * scale)
        }
    }
}

/// Adds every derived field computable from the counting fields present in `sums`.
pub fn with_derived(mut sums: FieldValues) -> FieldValues {
    for field in [MetricField::Ctr, MetricField::Cpc, MetricField::Cpm, MetricField::Roas] {
        if field.inputs().iter().all(|i| sums.contains_key(i)) {
            if let Some(value) = combine(field, &sums) {
                sums.insert(field, value);
            }
        }
    }
    sums
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_counting_and_derived_fields() {
        assert_eq!(MetricField::detect("how many sales today"), vec![MetricField::Sales]);
        assert_eq!(
            MetricField::detect("what's the cost per click and ctr"),
            vec![MetricField::Ctr, MetricField::Cpc]
        );
        assert_eq!(MetricField::detect("ROAS for Miami"), vec![MetricField::Roas]);
        assert_eq!(
            MetricField::detect("cuántos boletos vendimos y el gasto"),
            vec![MetricField::Sales, MetricField::Spend]
        );
        assert!(MetricField::detect("hello there").is_empty());
    }

    #[test]
    fn derived_fields_are_recomputed_not_summed() {
        let sums = FieldValues::from([
            (MetricField::Clicks, 50.0),
            (MetricField::Impressions, 2000.0),
            (MetricField::Spend, 100.0),
            (MetricField::Revenue, 400.0),
        ]);
        assert_eq!(combine(MetricField::Ctr, &sums), Some(2.5));
        assert_eq!(combine(MetricField::Cpc, &sums), Some(2.0));
        assert_eq!(combine(MetricField::Cpm, &sums), Some(50.0));
        assert_eq!(combine(MetricField::Roas, &sums), Some(4.0));
        assert_eq!(combine(MetricField::Sales, &sums), Some(0.0));
    }

    #[test]
    fn zero_denominator_has_no_value() {
        let sums = FieldValues::from([(MetricField::Revenue, 10.0), (MetricField::Spend, 0.0)]);
        assert_eq!(combine(MetricField::Roas, &sums), None);
        let derived = with_derived(sums);
        assert!(!derived.contains_key(&MetricField::Roas));
    }

    #[test]
    fn expand_inputs_reaches_counting_fields() {
        let inputs = expand_inputs(&[MetricField::Roas, MetricField::Sales]);
        assert_eq!(
            inputs,
            BTreeSet::from([MetricField::Sales, MetricField::Revenue, MetricField::Spend])
        );
    }
}
