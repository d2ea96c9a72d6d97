//! Query planner: turns an authorized scope and a structured intent into fetch
//! plans at the level where the source reports events faithfully.
//!
//! Counting metrics pre-aggregated at the top level are not trusted (they can
//! under-report relative to the sum of their children), so a Top entity is always
//! expanded to its descendants at the faithful level. An entity already at or below
//! that level is fetched as-is.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::PlannerConfig;
use crate::guard::AuthorizedScope;
use crate::hierarchy::{EntityId, EntityTree, Level};
use crate::intent::StructuredIntent;
use crate::metrics::{expand_inputs, MetricField, REPORT_FIELDS};
use crate::source::Breakdown;
use crate::window::TimeWindow;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub level: Level,
    pub entities: BTreeSet<EntityId>,
    /// Counting fields to fetch; derived fields are recomputed from these.
    pub fields: BTreeSet<MetricField>,
    pub window: TimeWindow,
    pub breakdown: Option<Breakdown>,
    /// Fetched entity → the scope entity it was expanded from.
    pub origin: BTreeMap<EntityId, EntityId>,
}

pub struct QueryPlanner {
    tree: Arc<EntityTree>,
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(tree: Arc<EntityTree>, config: PlannerConfig) -> Self {
        Self { tree, config }
    }

    /// Level to fetch an entity at: its own level or the faithful level, whichever is finer.
    pub fn fetch_level(&self, entity_level: Level) -> Level {
        entity_level.max(self.config.faithful_level)
    }

    /// Counting fields needed for `intent`. No named metric means the default report set.
    pub fn fields_for(intent: &StructuredIntent) -> BTreeSet<MetricField> {
        let mut wanted: Vec<MetricField> = intent.metrics.clone();
        if wanted.is_empty() || intent.report {
            wanted.extend(REPORT_FIELDS);
        }
        expand_inputs(&wanted)
    }

    /// Finest covering set under `id`: descends until `target` is reached. A branch
    /// that ends above `target` contributes its lowest entity, which holds the finest
    /// data available for it.
    fn expand(&self, id: &EntityId, target: Level, out: &mut Vec<(Level, EntityId)>) {
        let Some(level) = self.tree.level_of(id) else { return };
        let children = self.tree.children_of(id);
        if level >= target || children.is_empty() {
            out.push((level, id.clone()));
        } else {
            for child in &children {
                self.expand(child, target, out);
            }
        }
    }

    /// One plan per fetch level. Empty when the scope holds no catalog entity.
    pub fn plan(&self, intent: &StructuredIntent, scope: &AuthorizedScope, today: NaiveDate) -> Vec<FetchPlan> {
        let window = TimeWindow::resolve(intent.time_signal.as_deref().unwrap_or(""), today);
        let fields = Self::fields_for(intent);
        let breakdown = intent
            .location
            .as_ref()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Breakdown {
                dimension: self.config.location_dimension.clone(),
                value: l.trim().to_string(),
            });

        let mut planned: BTreeMap<EntityId, (Level, EntityId)> = BTreeMap::new();
        for root in scope.roots(&self.tree) {
            let Some(level) = self.tree.level_of(&root) else { continue };
            let mut expanded = Vec::new();
            self.expand(&root, self.fetch_level(level), &mut expanded);
            for (level, entity) in expanded {
                planned.entry(entity).or_insert_with(|| (level, root.clone()));
            }
        }

        // An entity already covered by a planned ancestor would be counted twice.
        let covered: Vec<EntityId> = planned
            .keys()
            .filter(|e| planned.keys().any(|other| self.tree.is_ancestor(other, e)))
            .cloned()
            .collect();
        for entity in covered {
            planned.remove(&entity);
        }

        let mut by_level: BTreeMap<Level, (BTreeSet<EntityId>, BTreeMap<EntityId, EntityId>)> = BTreeMap::new();
        for (entity, (level, root)) in planned {
            let (entities, origin) = by_level.entry(level).or_default();
            origin.insert(entity.clone(), root);
            entities.insert(entity);
        }

        let plans: Vec<FetchPlan> = by_level
            .into_iter()
            .map(|(level, (entities, origin))| FetchPlan {
                level,
                entities,
                fields: fields.clone(),
                window,
                breakdown: breakdown.clone(),
                origin,
            })
            .collect();

        debug!(
            target: "concierge::planner",
            plans = plans.len(),
            entities = plans.iter().map(|p| p.entities.len()).sum::<usize>(),
            window = ?window,
            "Fetch plans built"
        );
        plans
    }
}
