//! Rule instantiator: expands a template against the topology graph
//! into per-entity rule instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use faultline_core::model::{RuleInstance, RuleInstanceId, RuleTemplate};
use faultline_storage::RuleInstanceRepository;

use crate::error::RulesError;
use crate::topology::TopologyQuery;

/// Delta produced by one template expansion.
#[derive(Debug, Default)]
pub struct Expansion {
    pub created: Vec<RuleInstance>,
    pub retired: Vec<RuleInstanceId>,
}

pub struct RuleInstantiator {
    topology: Arc<dyn TopologyQuery>,
    instances: Arc<dyn RuleInstanceRepository>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl RuleInstantiator {
    pub fn new(
        topology: Arc<dyn TopologyQuery>,
        instances: Arc<dyn RuleInstanceRepository>,
    ) -> Self {
        Self {
            topology,
            instances,
            max_attempts: 4,
            base_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    /// Expand a template: create Pending instances for newly applicable
    /// entities, retire instances whose entity dropped out, upgrade
    /// instances to a newer template version in place.
    ///
    /// All-or-nothing: the created/retired set is computed fully, then
    /// committed in one store transaction. A topology failure aborts
    /// the whole expansion and is retried with exponential backoff;
    /// nothing partial is ever written.
    pub async fn expand(&self, template: &RuleTemplate) -> Result<Expansion, RulesError> {
        let mut attempt = 0;
        loop {
            match self.try_expand(template).await {
                Ok(expansion) => {
                    self.instances
                        .apply_expansion(&expansion.created, &expansion.retired)
                        .await?;
                    info!(
                        template_id = %template.id,
                        version = template.version,
                        created = expansion.created.len(),
                        retired = expansion.retired.len(),
                        "template expanded"
                    );
                    return Ok(expansion);
                }
                Err(RulesError::Topology(reason)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(RulesError::ExpansionFailed {
                            template_id: template.id.clone(),
                            attempts: attempt,
                            reason,
                        });
                    }
                    let backoff = self.base_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        template_id = %template.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %reason,
                        "topology query failed, retrying expansion"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retire every evaluatable instance of a template lineage.
    ///
    /// Used when a template is deleted from the repository or disabled.
    pub async fn retire_template(&self, template_id: &str) -> Result<Expansion, RulesError> {
        let existing = self.instances.list_by_template(template_id).await?;
        let retired: Vec<RuleInstanceId> = existing
            .iter()
            .filter(|i| i.is_evaluatable())
            .map(|i| i.id.clone())
            .collect();
        self.instances.apply_expansion(&[], &retired).await?;
        info!(template_id = %template_id, retired = retired.len(), "template retired");
        Ok(Expansion {
            created: Vec::new(),
            retired,
        })
    }

    /// Compute the delta without committing anything.
    async fn try_expand(&self, template: &RuleTemplate) -> Result<Expansion, RulesError> {
        if !template.enabled {
            // Disabled template behaves like a removed one.
            let existing = self.instances.list_by_template(&template.id).await?;
            return Ok(Expansion {
                created: Vec::new(),
                retired: existing
                    .iter()
                    .filter(|i| i.is_evaluatable())
                    .map(|i| i.id.clone())
                    .collect(),
            });
        }

        let applicable = self.topology.query_entities(&template.applicability).await?;
        let existing = self.instances.list_by_template(&template.id).await?;
        let existing_by_entity: HashMap<&str, &RuleInstance> = existing
            .iter()
            .map(|i| (i.entity_id.as_str(), i))
            .collect();

        let mut expansion = Expansion::default();

        for entity_id in &applicable {
            match existing_by_entity.get(entity_id.as_str()) {
                Some(current)
                    if current.is_evaluatable()
                        && current.rule_template_version >= template.version =>
                {
                    // Already instantiated at this (or a newer) version.
                    continue;
                }
                _ => {
                    let bindings = self.resolve_bindings(template, entity_id).await?;
                    expansion
                        .created
                        .push(RuleInstance::new(&template.id, template.version, entity_id, bindings));
                }
            }
        }

        // Entities no longer selected by the applicability query.
        for instance in &existing {
            if instance.is_evaluatable() && !applicable.contains(&instance.entity_id) {
                expansion.retired.push(instance.id.clone());
            }
        }

        Ok(expansion)
    }

    /// Resolve the template's point aliases against the entity's
    /// relationships. Aliases the entity cannot satisfy stay unbound;
    /// the actor reports the missing data when it needs them.
    async fn resolve_bindings(
        &self,
        template: &RuleTemplate,
        entity_id: &str,
    ) -> Result<HashMap<String, String>, RulesError> {
        let relationships = self.topology.relationships(entity_id).await?;
        let mut bindings = HashMap::new();
        for decl in &template.points {
            match relationships.iter().find(|r| r.capability == decl.capability) {
                Some(rel) => {
                    bindings.insert(decl.alias.clone(), rel.point_id.clone());
                }
                None => {
                    debug!(
                        entity_id = %entity_id,
                        alias = %decl.alias,
                        capability = %decl.capability,
                        "entity has no point for capability"
                    );
                }
            }
        }
        Ok(bindings)
    }
}
