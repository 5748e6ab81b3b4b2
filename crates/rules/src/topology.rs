//! Topology graph query seam.
//!
//! The topology graph service is an external collaborator; the engine
//! only consumes it through [`TopologyQuery`]. [`StaticTopology`] is the
//! in-memory implementation used by tests and local runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use faultline_core::model::{EntityId, PointId};

use crate::error::RulesError;

/// An entity's relationship to one of its points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Capability tag matched against template point declarations.
    pub capability: String,
    pub point_id: PointId,
}

/// Read-only, eventually-consistent view of the topology graph.
#[async_trait]
pub trait TopologyQuery: Send + Sync {
    /// Entities matching an applicability query
    /// (`model:<id>` or `entity:<id>`).
    async fn query_entities(&self, applicability: &str) -> Result<Vec<EntityId>, RulesError>;

    /// Point relationships of one entity.
    async fn relationships(&self, entity_id: &str) -> Result<Vec<Relationship>, RulesError>;
}

#[derive(Debug, Clone)]
struct EntityRecord {
    model: String,
    relationships: Vec<Relationship>,
}

/// In-memory topology with a model index.
#[derive(Default)]
pub struct StaticTopology {
    entities: RwLock<HashMap<EntityId, EntityRecord>>,
    /// When set, queries fail — used to exercise the all-or-nothing
    /// expansion path.
    fail: std::sync::atomic::AtomicBool,
}

/// One entity in a topology YAML document.
#[derive(Debug, Deserialize)]
struct EntityDecl {
    id: String,
    model: String,
    #[serde(default)]
    points: Vec<Relationship>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load entities from a YAML list of `{id, model, points}` records.
    pub fn from_yaml(contents: &str) -> Result<Self, RulesError> {
        let decls: Vec<EntityDecl> = serde_yaml::from_str(contents)?;
        let topo = Self::new();
        for decl in decls {
            topo.add_entity(&decl.id, &decl.model, decl.points);
        }
        Ok(topo)
    }

    pub fn add_entity(&self, entity_id: &str, model: &str, relationships: Vec<Relationship>) {
        self.entities.write().expect("topology lock poisoned").insert(
            entity_id.to_string(),
            EntityRecord {
                model: model.to_string(),
                relationships,
            },
        );
    }

    pub fn remove_entity(&self, entity_id: &str) {
        self.entities
            .write()
            .expect("topology lock poisoned")
            .remove(entity_id);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), RulesError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            Err(RulesError::Topology("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TopologyQuery for StaticTopology {
    async fn query_entities(&self, applicability: &str) -> Result<Vec<EntityId>, RulesError> {
        self.check_failing()?;
        let entities = self.entities.read().expect("topology lock poisoned");
        match applicability.split_once(':') {
            Some(("model", model)) => {
                let mut matched: Vec<EntityId> = entities
                    .iter()
                    .filter(|(_, rec)| rec.model == model.trim())
                    .map(|(id, _)| id.clone())
                    .collect();
                matched.sort();
                Ok(matched)
            }
            Some(("entity", id)) => {
                let id = id.trim();
                Ok(if entities.contains_key(id) {
                    vec![id.to_string()]
                } else {
                    Vec::new()
                })
            }
            _ => Err(RulesError::Validation(format!(
                "unknown applicability query '{}'",
                applicability
            ))),
        }
    }

    async fn relationships(&self, entity_id: &str) -> Result<Vec<Relationship>, RulesError> {
        self.check_failing()?;
        Ok(self
            .entities
            .read()
            .expect("topology lock poisoned")
            .get(entity_id)
            .map(|rec| rec.relationships.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(capability: &str, point_id: &str) -> Relationship {
        Relationship {
            capability: capability.to_string(),
            point_id: point_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_model_query_matches_all_of_model() {
        let topo = StaticTopology::new();
        topo.add_entity("e1", "ahu", vec![rel("supply-temp", "p1")]);
        topo.add_entity("e2", "ahu", vec![rel("supply-temp", "p2")]);
        topo.add_entity("e3", "vav", vec![]);

        let matched = topo.query_entities("model:ahu").await.unwrap();
        assert_eq!(matched, vec!["e1".to_string(), "e2".to_string()]);
    }

    #[tokio::test]
    async fn test_entity_query_matches_one() {
        let topo = StaticTopology::new();
        topo.add_entity("e1", "ahu", vec![]);
        assert_eq!(topo.query_entities("entity:e1").await.unwrap(), vec!["e1"]);
        assert!(topo.query_entities("entity:missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_yaml() {
        let topo = StaticTopology::from_yaml(
            r#"
- id: e1
  model: ahu
  points:
    - capability: supply-temp
      point_id: p1
- id: e2
  model: vav
"#,
        )
        .unwrap();
        assert_eq!(topo.query_entities("model:ahu").await.unwrap(), vec!["e1"]);
        assert_eq!(
            topo.relationships("e1").await.unwrap(),
            vec![rel("supply-temp", "p1")]
        );
        assert!(topo.relationships("e2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let topo = StaticTopology::new();
        topo.set_failing(true);
        assert!(topo.query_entities("model:ahu").await.is_err());
        topo.set_failing(false);
        assert!(topo.query_entities("model:ahu").await.is_ok());
    }
}
