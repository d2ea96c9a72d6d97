//! Entity hierarchy: a forest of Top (campaign) → Mid (ad set / market) → Leaf (ad)
//! entities. Every Mid has exactly one Top parent and every Leaf exactly one Mid
//! parent, so the structure is acyclic by construction.
//!
//! Catalog format (`catalog.toml`):
//!
//! ```toml
//! [[entities]]
//! id = "120232002620350525"
//! level = "top"
//! name = "SENDE Tour"
//!
//! [[entities]]
//! id = "120232002620370525"
//! level = "mid"
//! parent = "120232002620350525"
//! name = "Miami"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::error::CatalogError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Hierarchy level. Ordering follows granularity: `Top < Mid < Leaf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Top,
    Mid,
    Leaf,
}

impl Level {
    pub fn parent_level(&self) -> Option<Level> {
        match self {
            Level::Top => None,
            Level::Mid => Some(Level::Top),
            Level::Leaf => Some(Level::Mid),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Top => "top",
            Level::Mid => "mid",
            Level::Leaf => "leaf",
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    level: Level,
    parent: Option<EntityId>,
    name: Option<String>,
    children: BTreeSet<EntityId>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityTree {
    nodes: BTreeMap<EntityId, Node>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    entities: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    level: Level,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Collects entities in any order; parent links are validated in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct EntityTreeBuilder {
    entries: Vec<(EntityId, Level, Option<EntityId>, Option<String>)>,
}

impl EntityTreeBuilder {
    pub fn top(mut self, id: &str, name: Option<&str>) -> Self {
        self.entries
            .push((EntityId::new(id), Level::Top, None, name.map(str::to_string)));
        self
    }

    pub fn mid(mut self, id: &str, parent: &str, name: Option<&str>) -> Self {
        self.entries.push((
            EntityId::new(id),
            Level::Mid,
            Some(EntityId::new(parent)),
            name.map(str::to_string),
        ));
        self
    }

    pub fn leaf(mut self, id: &str, parent: &str, name: Option<&str>) -> Self {
        self.entries.push((
            EntityId::new(id),
            Level::Leaf,
            Some(EntityId::new(parent)),
            name.map(str::to_string),
        ));
        self
    }

    pub fn build(self) -> Result<EntityTree, CatalogError> {
        let mut nodes: BTreeMap<EntityId, Node> = BTreeMap::new();
        for (id, level, parent, name) in &self.entries {
            if nodes.contains_key(id) {
                return Err(CatalogError::Duplicate(id.to_string()));
            }
            match (level, parent) {
                (Level::Top, Some(_)) => return Err(CatalogError::TopWithParent(id.to_string())),
                (Level::Mid | Level::Leaf, None) => {
                    return Err(CatalogError::MissingParent(id.to_string()))
                }
                _ => {}
            }
            nodes.insert(
                id.clone(),
                Node {
                    level: *level,
                    parent: parent.clone(),
                    name: name.clone(),
                    children: BTreeSet::new(),
                },
            );
        }

        for (id, level, parent, _) in &self.entries {
            let Some(parent) = parent else { continue };
            let parent_node = nodes.get_mut(parent).ok_or_else(|| CatalogError::UnknownParent {
                id: id.to_string(),
                parent: parent.to_string(),
            })?;
            if Some(parent_node.level) != level.parent_level() {
                return Err(CatalogError::WrongParentLevel {
                    id: id.to_string(),
                    parent: parent.to_string(),
                });
            }
            parent_node.children.insert(id.clone());
        }

        Ok(EntityTree { nodes })
    }
}

impl EntityTree {
    pub fn builder() -> EntityTreeBuilder {
        EntityTreeBuilder::default()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(raw)?;
        let mut builder = Self::builder();
        for entry in file.entities {
            builder.entries.push((
                EntityId::new(entry.id.trim()),
                entry.level,
                entry.parent.map(|p| EntityId::new(p.trim())),
                entry.name,
            ));
        }
        builder.build()
    }

    pub fn load_from_path(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let tree = Self::from_toml_str(&raw)?;
        tracing::info!(
            target: "concierge::planner",
            path = %path.display(),
            entities = tree.len(),
            "Entity catalog loaded"
        );
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn level_of(&self, id: &EntityId) -> Option<Level> {
        self.nodes.get(id).map(|n| n.level)
    }

    pub fn parent_of(&self, id: &EntityId) -> Option<&EntityId> {
        self.nodes.get(id).and_then(|n| n.parent.as_ref())
    }

    pub fn children_of(&self, id: &EntityId) -> Vec<EntityId> {
        self.nodes
            .get(id)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn name_of(&self, id: &EntityId) -> Option<&str> {
        self.nodes.get(id).and_then(|n| n.name.as_deref())
    }

    /// Human label: the catalog name, falling back to the id.
    pub fn display_name(&self, id: &EntityId) -> String {
        self.name_of(id)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }

    pub fn entities_at(&self, level: Level) -> BTreeSet<EntityId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.level == level)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Names of all Mid entities, which double as market names.
    pub fn market_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .nodes
            .values()
            .filter(|n| n.level == Level::Mid)
            .filter_map(|n| n.name.clone())
            .collect();
        names.into_iter().collect()
    }

    /// True when `ancestor` sits strictly above `descendant` on the same branch.
    pub fn is_ancestor(&self, ancestor: &EntityId, descendant: &EntityId) -> bool {
        let mut current = self.parent_of(descendant);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent_of(parent);
        }
        false
    }

    /// Entities at `level` under (or equal to) `id`. Empty when `level` is coarser
    /// than `id` or when `id` is unknown.
    pub fn descendants_at(&self, id: &EntityId, level: Level) -> BTreeSet<EntityId> {
        let mut out = BTreeSet::new();
        let Some(node) = self.nodes.get(id) else {
            return out;
        };
        if node.level == level {
            out.insert(id.clone());
        } else if node.level < level {
            for child in &node.children {
                out.extend(self.descendants_at(child, level));
            }
        }
        out
    }

    /// Catalog entity ids that appear as whole tokens in `text`.
    pub fn mentioned_in(&self, text: &str) -> BTreeSet<EntityId> {
        text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
            .filter(|token| !token.is_empty())
            .map(EntityId::new)
            .filter(|id| self.nodes.contains_key(id))
            .collect()
    }
}
