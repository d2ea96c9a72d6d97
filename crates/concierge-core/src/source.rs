//! Metrics data source seam and an in-memory implementation.
//!
//! [`MemoryMetricSource`] serves daily rows (from a snapshot file or a test
//! fixture) and can be scripted to fail or stall per entity.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::FetchError;
use crate::hierarchy::{EntityId, Level};
use crate::metrics::{FieldValues, MetricField};
use crate::window::TimeWindow;

/// Restricts a fetch to one value of a breakdown dimension, e.g. `city = Miami`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Breakdown {
    pub dimension: String,
    pub value: String,
}

impl Breakdown {
    pub fn matches(&self, segment: Option<&str>) -> bool {
        segment.is_some_and(|s| s.eq_ignore_ascii_case(&self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub entity: EntityId,
    pub level: Level,
    pub values: FieldValues,
    pub window: TimeWindow,
    /// Breakdown value this record is restricted to, if any.
    #[serde(default)]
    pub segment: Option<String>,
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(
        &self,
        level: Level,
        entities: &[EntityId],
        fields: &BTreeSet<MetricField>,
        window: &TimeWindow,
        breakdown: Option<&Breakdown>,
    ) -> Result<Vec<MetricRecord>, FetchError>;
}

/// One day of values for one entity, optionally for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub entity: EntityId,
    pub level: Level,
    pub date: NaiveDate,
    #[serde(default)]
    pub segment: Option<String>,
    pub values: FieldValues,
}

#[derive(Debug, Clone)]
enum Scripted {
    /// Fail transiently this many more times, then succeed.
    Transient(u32),
    Permanent,
}

pub struct MemoryMetricSource {
    rows: Vec<MetricRow>,
    clock: Arc<dyn Clock>,
    failures: Mutex<HashMap<EntityId, Scripted>>,
    delays: HashMap<EntityId, Duration>,
    calls: AtomicUsize,
}

impl MemoryMetricSource {
    pub fn new(rows: Vec<MetricRow>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows,
            clock,
            failures: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Loads rows from a JSON array of [`MetricRow`].
    pub fn from_json(raw: &str, clock: Arc<dyn Clock>) -> Result<Self, serde_json::Error> {
        let rows: Vec<MetricRow> = serde_json::from_str(raw)?;
        Ok(Self::new(rows, clock))
    }

    pub fn fail_transient(&self, entity: &str, times: u32) {
        self.script(entity, Scripted::Transient(times));
    }

    pub fn fail_permanent(&self, entity: &str) {
        self.script(entity, Scripted::Permanent);
    }

    fn script(&self, entity: &str, behavior: Scripted) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(EntityId::new(entity), behavior);
    }

    /// Every fetch touching `entity` sleeps this long first.
    pub fn with_delay(mut self, entity: &str, delay: Duration) -> Self {
        self.delays.insert(EntityId::new(entity), delay);
        self
    }

    /// Number of `fetch` calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, entities: &[EntityId]) -> Option<FetchError> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for entity in entities {
            match failures.get_mut(entity) {
                Some(Scripted::Permanent) => {
                    return Some(FetchError::Permanent(format!("entity {entity} is not accessible")))
                }
                Some(Scripted::Transient(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Some(FetchError::Transient(format!("entity {entity} throttled")));
                }
                _ => {}
            }
        }
        None
    }
}

#[async_trait]
impl MetricSource for MemoryMetricSource {
    async fn fetch(
        &self,
        level: Level,
        entities: &[EntityId],
        fields: &BTreeSet<MetricField>,
        window: &TimeWindow,
        breakdown: Option<&Breakdown>,
    ) -> Result<Vec<MetricRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = entities
            .iter()
            .filter_map(|e| self.delays.get(e))
            .max()
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.scripted_failure(entities) {
            return Err(err);
        }

        let today = self.clock.today();
        let mut records = Vec::new();
        for entity in entities {
            let mut values = FieldValues::new();
            let mut any = false;
            for row in self.rows.iter().filter(|r| &r.entity == entity && r.level == level) {
                if !window.contains(row.date, today) {
                    continue;
                }
                if let Some(b) = breakdown {
                    if !b.matches(row.segment.as_deref()) {
                        continue;
                    }
                }
                any = true;
                for (field, value) in &row.values {
                    if fields.contains(field) {
                        *values.entry(*field).or_insert(0.0) += value;
                    }
                }
            }
            if any {
                records.push(MetricRecord {
                    entity: entity.clone(),
                    level,
                    values,
                    window: *window,
                    segment: breakdown.map(|b| b.value.clone()),
                });
            }
        }
        Ok(records)
    }
}
