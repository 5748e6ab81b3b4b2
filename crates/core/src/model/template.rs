use serde::{Deserialize, Serialize};

/// Declarative, versioned rule definition.
///
/// Templates are authored in the git-backed rule repository and never
/// mutated in place — a higher `version` supersedes the old one. The
/// `id` is the lineage key: all versions of a rule share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTemplate {
    /// Lineage id, stable across versions (e.g. "ahu-supply-temp-high").
    pub id: String,
    /// Monotonically increasing version within the lineage.
    pub version: u32,
    /// Human-readable rule name.
    pub name: String,
    /// Whether instances of this template should be evaluated.
    pub enabled: bool,
    /// Reference resolved by the evaluator provider (e.g. "threshold").
    pub expression_ref: String,
    /// Evaluator-specific parameters, passed through opaquely.
    pub params: serde_json::Value,
    /// Query selecting applicable entities from the topology graph.
    /// Format: `model:<model-id>` or `entity:<entity-id>`.
    pub applicability: String,
    /// Point aliases the evaluator reads, bound per entity at
    /// instantiation time.
    pub points: Vec<PointBinding>,
}

/// A point the rule needs, identified by capability within the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointBinding {
    /// Name the evaluator uses to address the point (e.g. "supply_temp").
    pub alias: String,
    /// Capability tag matched against the entity's point relationships.
    pub capability: String,
}

impl RuleTemplate {
    /// Whether `other` is a newer version of the same lineage.
    pub fn is_superseded_by(&self, other: &RuleTemplate) -> bool {
        self.id == other.id && other.version > self.version
    }
}
