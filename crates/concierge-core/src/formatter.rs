//! Response formatter: turns aggregated results and CRM outcomes into the short
//! plain-text reply sent back over the messaging channel.
//!
//! Three shapes: a direct answer ("12 sales today"), a per-market list sorted by
//! the metric, and a full report. Partial results always lead with an explicit
//! incompleteness notice. Every composed reply passes the topic filter once more
//! before it leaves.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::warn;

use crate::aggregation::AggregatedResult;
use crate::crm::OperationResult;
use crate::hierarchy::EntityTree;
use crate::intent::{Capability, Language, StructuredIntent};
use crate::metrics::{MetricField, REPORT_FIELDS};
use crate::topic::{TopicClass, TopicFilter, Verdict, RESTRICTED_REPLY};

/// One block of a reply.
#[derive(Debug, Clone, Copy)]
pub enum Section<'a> {
    Metrics(&'a AggregatedResult),
    Crm(&'a OperationResult),
    /// That half of the request could not be served.
    Unavailable(Capability),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Answer(String),
    /// The composed text tripped the topic filter and must not be sent.
    Withheld(TopicClass),
}

impl Rendered {
    pub fn into_text(self) -> String {
        match self {
            Rendered::Answer(text) => text,
            Rendered::Withheld(_) => RESTRICTED_REPLY.to_string(),
        }
    }
}

pub struct ResponseFormatter {
    filter: Arc<TopicFilter>,
    tree: Arc<EntityTree>,
}

impl ResponseFormatter {
    pub fn new(filter: Arc<TopicFilter>, tree: Arc<EntityTree>) -> Self {
        Self { filter, tree }
    }

    /// Reply text for a metrics result.
    pub fn format(&self, result: &AggregatedResult, intent: &StructuredIntent) -> String {
        self.render(&[Section::Metrics(result)], intent).into_text()
    }

    /// Reply text for a CRM outcome.
    pub fn format_crm(&self, result: &OperationResult, intent: &StructuredIntent) -> String {
        self.render(&[Section::Crm(result)], intent).into_text()
    }

    pub fn render(&self, sections: &[Section<'_>], intent: &StructuredIntent) -> Rendered {
        let lang = intent.language;
        let mut parts = Vec::new();

        let partial = sections.iter().find_map(|s| match s {
            Section::Metrics(r) if r.partial && !r.is_unavailable() => Some(*r),
            _ => None,
        });
        if let Some(result) = partial {
            parts.push(incomplete_notice(result, lang));
        }

        for section in sections {
            let text = match section {
                Section::Metrics(result) if result.is_unavailable() => unavailable(Capability::MetricsQuery, lang),
                Section::Metrics(result) => self.metrics_text(result, intent),
                Section::Crm(result) => crm_text(result, lang),
                Section::Unavailable(capability) => unavailable(*capability, lang),
            };
            parts.push(text);
        }

        self.screen(capitalize_first(&parts.join("\n\n")))
    }

    /// Runs the topic filter over outgoing text.
    pub fn screen(&self, text: String) -> Rendered {
        match self.filter.classify(&text) {
            Verdict::Allowed => Rendered::Answer(text),
            Verdict::Restricted(class) => {
                warn!(target: "concierge::topic", class = ?class, "Composed reply withheld");
                Rendered::Withheld(class)
            }
        }
    }

    fn metrics_text(&self, result: &AggregatedResult, intent: &StructuredIntent) -> String {
        if intent.by_market {
            let fields: Vec<MetricField> = if intent.metrics.is_empty() {
                vec![MetricField::Sales]
            } else {
                intent.metrics.clone()
            };
            return fields
                .iter()
                .map(|f| self.market_list(result, *f, intent))
                .collect::<Vec<_>>()
                .join("\n\n");
        }
        if intent.report || intent.metrics.is_empty() {
            return report(result, intent);
        }
        intent
            .metrics
            .iter()
            .map(|f| direct_line(result, *f, intent))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn market_list(&self, result: &AggregatedResult, field: MetricField, intent: &StructuredIntent) -> String {
        let lang = intent.language;
        let mut rows: Vec<(String, Option<f64>)> = result
            .by_entity
            .iter()
            .map(|(entity, values)| (self.tree.display_name(entity), values.get(&field).copied()))
            .collect();
        rows.sort_by(|a, b| {
            let by_value = b.1.unwrap_or(f64::MIN).partial_cmp(&a.1.unwrap_or(f64::MIN));
            by_value.unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0))
        });

        let heading = match lang {
            Language::En => format!("{} by market {}:", field.title(lang), result.window.label(lang)),
            Language::Es => format!("{} por mercado {}:", field.title(lang), result.window.label(lang)),
        };
        let mut lines = vec![heading];
        if rows.is_empty() {
            lines.push(match lang {
                Language::En => "No activity in this period.".to_string(),
                Language::Es => "Sin actividad en este periodo.".to_string(),
            });
        }
        for (name, value) in rows {
            lines.push(format!("• {name}: {}", display_value(field, value, lang)));
        }
        lines.push(format!("Total: {}", display_value(field, result.value(field), lang)));
        lines.join("\n")
    }
}

fn report(result: &AggregatedResult, intent: &StructuredIntent) -> String {
    let lang = intent.language;
    let mut fields: Vec<MetricField> = REPORT_FIELDS.to_vec();
    for f in &intent.metrics {
        if !fields.contains(f) {
            fields.push(*f);
        }
    }
    let place = location_phrase(intent);
    let heading = match lang {
        Language::En => format!("Results{place} {}:", result.window.label(lang)),
        Language::Es => format!("Resultados{place} {}:", result.window.label(lang)),
    };
    let mut lines = vec![heading];
    for field in fields {
        lines.push(format!(
            "• {}: {}",
            field.title(lang),
            display_value(field, result.value(field), lang)
        ));
    }
    lines.join("\n")
}

fn direct_line(result: &AggregatedResult, field: MetricField, intent: &StructuredIntent) -> String {
    let lang = intent.language;
    let place = location_phrase(intent);
    let window = result.window.label(lang);
    let value = result.value(field);
    match (value, noun(field, lang)) {
        (Some(v), Some(noun)) => format!("{} {noun}{place} {window}", format_value(field, v)),
        _ => format!("{}{place} {window}: {}", field.title(lang), display_value(field, value, lang)),
    }
}

fn location_phrase(intent: &StructuredIntent) -> String {
    match (&intent.location, intent.language) {
        (Some(loc), Language::En) => format!(" in {loc}"),
        (Some(loc), Language::Es) => format!(" en {loc}"),
        (None, _) => String::new(),
    }
}

/// Plural noun for counts read as "12 sales"; money and rates have none.
fn noun(field: MetricField, lang: Language) -> Option<&'static str> {
    match (field, lang) {
        (MetricField::Sales, Language::En) => Some("sales"),
        (MetricField::Sales, Language::Es) => Some("ventas"),
        (MetricField::Impressions, Language::En) => Some("impressions"),
        (MetricField::Impressions, Language::Es) => Some("impresiones"),
        (MetricField::Clicks, Language::En) => Some("clicks"),
        (MetricField::Clicks, Language::Es) => Some("clics"),
        (MetricField::Leads, Language::En) => Some("leads"),
        (MetricField::Leads, Language::Es) => Some("prospectos"),
        _ => None,
    }
}

fn display_value(field: MetricField, value: Option<f64>, lang: Language) -> String {
    match value {
        Some(v) => format_value(field, v),
        None => match lang {
            Language::En => "n/a".to_string(),
            Language::Es => "n/d".to_string(),
        },
    }
}

fn format_value(field: MetricField, value: f64) -> String {
    match field {
        MetricField::Spend | MetricField::Revenue | MetricField::Cpc | MetricField::Cpm => money(value),
        MetricField::Ctr => format!("{value:.2}%"),
        MetricField::Roas => format!("{value:.2}x"),
        _ => group_thousands(value.round().max(0.0) as u64),
    }
}

fn money(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}${}.{:02}", group_thousands(cents / 100), cents % 100)
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn incomplete_notice(result: &AggregatedResult, lang: Language) -> String {
    let total = result.coverage.len() + result.missing.len();
    let missing = result.missing.len();
    match lang {
        Language::En => format!(
            "Data incomplete: {missing} of {total} data sources could not be retrieved, so these figures are partial."
        ),
        Language::Es => format!(
            "Datos incompletos: no se pudieron obtener {missing} de {total} fuentes de datos, así que estas cifras son parciales."
        ),
    }
}

fn unavailable(capability: Capability, lang: Language) -> String {
    match (capability, lang) {
        (Capability::MetricsQuery, Language::En) => {
            "Campaign results are unavailable right now. Please try again shortly.".to_string()
        }
        (Capability::MetricsQuery, Language::Es) => {
            "Los resultados de la campaña no están disponibles en este momento. Intenta de nuevo en breve.".to_string()
        }
        (Capability::CrmOperation, Language::En) => {
            "The CRM part of your request is unavailable right now.".to_string()
        }
        (Capability::CrmOperation, Language::Es) => {
            "La parte de CRM de tu solicitud no está disponible en este momento.".to_string()
        }
    }
}

fn crm_text(result: &OperationResult, lang: Language) -> String {
    let summary = result.summary.trim();
    match (result.count, lang) {
        (Some(n), Language::En) => format!("CRM: {summary} ({n} found)"),
        (Some(n), Language::Es) => format!("CRM: {summary} ({n} encontrados)"),
        (None, _) => format!("CRM: {summary}"),
    }
}

fn capitalize_first(s: &str) -> String {
    let t = s.trim();
    let mut chars = t.chars();
    match chars.next() {
        Some(c) if c.is_lowercase() => c.to_uppercase().chain(chars).collect(),
        _ => t.to_string(),
    }
}
