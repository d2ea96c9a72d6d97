//! Aggregation engine: executes fetch plans against the metrics source and combines
//! the records into one result.
//!
//! Fetches run one per entity, bounded by `max_concurrency`, under a single
//! request deadline. Transient errors are retried with exponential backoff;
//! permanent errors and deadline expiry mark the entity missing. Whatever the
//! completion order, the combined values are the same: records are sorted before
//! summing and the combination itself is a pure function.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AggregationConfig;
use crate::error::FetchError;
use crate::hierarchy::{EntityId, EntityTree};
use crate::metrics::{with_derived, FieldValues, MetricField};
use crate::planner::FetchPlan;
use crate::source::{MetricRecord, MetricSource};
use crate::window::TimeWindow;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    /// Combined counting values plus every derived value computable from them.
    pub values: FieldValues,
    /// Per fetched entity, same shape as `values`.
    pub by_entity: BTreeMap<EntityId, FieldValues>,
    pub window: TimeWindow,
    /// Entities whose fetch succeeded.
    pub coverage: BTreeSet<EntityId>,
    /// Entities the plan expected but could not be fetched.
    pub missing: BTreeSet<EntityId>,
    pub partial: bool,
}

impl AggregatedResult {
    pub fn empty(window: TimeWindow) -> Self {
        Self {
            values: FieldValues::new(),
            by_entity: BTreeMap::new(),
            window,
            coverage: BTreeSet::new(),
            missing: BTreeSet::new(),
            partial: false,
        }
    }

    /// True when something was expected and nothing came back.
    pub fn is_unavailable(&self) -> bool {
        self.coverage.is_empty() && !self.missing.is_empty()
    }

    pub fn value(&self, field: MetricField) -> Option<f64> {
        self.values.get(&field).copied()
    }
}

/// Records that carry no finer record beneath them. A Top record is discarded when a
/// record for any of its descendants is present, so parent and child never both count.
pub fn most_granular<'a>(records: &'a [MetricRecord], tree: &EntityTree) -> Vec<&'a MetricRecord> {
    records
        .iter()
        .filter(|r| {
            !records
                .iter()
                .any(|other| other.entity != r.entity && tree.is_ancestor(&r.entity, &other.entity))
        })
        .collect()
}

/// Sums counting `fields` over the most granular records, then derives rate and
/// ratio fields. Input order does not matter.
pub fn combine_records(
    records: &[MetricRecord],
    tree: &EntityTree,
    fields: &BTreeSet<MetricField>,
) -> FieldValues {
    let mut kept = most_granular(records, tree);
    kept.sort_by(|a, b| (&a.entity, &a.segment).cmp(&(&b.entity, &b.segment)));

    let mut sums = FieldValues::new();
    for field in fields.iter().filter(|f| f.is_counting()) {
        let total: f64 = kept
            .iter()
            .map(|r| r.values.get(field).copied().unwrap_or(0.0))
            .sum();
        sums.insert(*field, total);
    }
    with_derived(sums)
}

pub struct AggregationEngine {
    source: Arc<dyn MetricSource>,
    tree: Arc<EntityTree>,
    config: AggregationConfig,
}

struct FetchJob<'a> {
    plan: &'a FetchPlan,
    entity: EntityId,
}

impl AggregationEngine {
    pub fn new(source: Arc<dyn MetricSource>, tree: Arc<EntityTree>, config: AggregationConfig) -> Self {
        Self { source, tree, config }
    }

    pub async fn aggregate(&self, plans: &[FetchPlan]) -> AggregatedResult {
        let window = plans.first().map(|p| p.window).unwrap_or_default();
        let jobs: Vec<FetchJob<'_>> = plans
            .iter()
            .flat_map(|plan| {
                plan.entities.iter().map(move |entity| FetchJob {
                    plan,
                    entity: entity.clone(),
                })
            })
            .collect();
        if jobs.is_empty() {
            return AggregatedResult::empty(window);
        }

        let deadline = Instant::now() + self.config.request_timeout();
        let outcomes: Vec<(EntityId, Option<Vec<MetricRecord>>)> = stream::iter(jobs)
            .map(move |job| async move {
                let fetched = tokio::time::timeout_at(deadline, self.fetch_with_retry(&job)).await;
                match fetched {
                    Ok(Ok(records)) => {
                        let kept = accepted(records, &job);
                        (job.entity, Some(kept))
                    }
                    Ok(Err(e)) => {
                        warn!(target: "concierge::aggregation", entity = %job.entity, error = %e, "Entity fetch failed");
                        (job.entity, None)
                    }
                    Err(_) => {
                        warn!(target: "concierge::aggregation", entity = %job.entity, "Entity fetch hit the request deadline");
                        (job.entity, None)
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut coverage = BTreeSet::new();
        let mut missing = BTreeSet::new();
        let mut records = Vec::new();
        for (entity, fetched) in outcomes {
            match fetched {
                Some(mut r) => {
                    coverage.insert(entity);
                    records.append(&mut r);
                }
                None => {
                    missing.insert(entity);
                }
            }
        }

        let fields: BTreeSet<MetricField> = plans.iter().flat_map(|p| p.fields.iter().copied()).collect();
        let values = combine_records(&records, &self.tree, &fields);

        let mut by_entity: BTreeMap<EntityId, Vec<MetricRecord>> = BTreeMap::new();
        for record in &records {
            by_entity.entry(record.entity.clone()).or_default().push(record.clone());
        }
        let by_entity = by_entity
            .into_iter()
            .map(|(entity, rs)| (entity, combine_records(&rs, &self.tree, &fields)))
            .collect();

        let partial = !missing.is_empty();
        debug!(
            target: "concierge::aggregation",
            covered = coverage.len(),
            missing = missing.len(),
            partial,
            "Aggregation complete"
        );
        AggregatedResult {
            values,
            by_entity,
            window,
            coverage,
            missing,
            partial,
        }
    }

    async fn fetch_with_retry(&self, job: &FetchJob<'_>) -> Result<Vec<MetricRecord>, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .source
                .fetch(
                    job.plan.level,
                    std::slice::from_ref(&job.entity),
                    &job.plan.fields,
                    &job.plan.window,
                    job.plan.breakdown.as_ref(),
                )
                .await;
            match result {
                Err(FetchError::Transient(reason)) if attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!(
                        target: "concierge::aggregation",
                        entity = %job.entity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient fetch error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Drops records the plan did not ask for: other entities, other levels, or
/// segments that do not match the requested breakdown.
fn accepted(records: Vec<MetricRecord>, job: &FetchJob<'_>) -> Vec<MetricRecord> {
    records
        .into_iter()
        .filter(|r| r.entity == job.entity && r.level == job.plan.level)
        .filter(|r| match &job.plan.breakdown {
            Some(b) => b.matches(r.segment.as_deref()),
            None => true,
        })
        .collect()
}
