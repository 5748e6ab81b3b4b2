use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityId, PointId};

/// Lifecycle status of a rule instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Created by the instantiator, not yet evaluated.
    Pending,
    /// Evaluating on triggers.
    Active,
    /// Paused by an operator; skipped at dispatch.
    Disabled,
    /// Superseded or no longer applicable; actor evicted after grace.
    Retired,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "Pending"),
            InstanceStatus::Active => write!(f, "Active"),
            InstanceStatus::Disabled => write!(f, "Disabled"),
            InstanceStatus::Retired => write!(f, "Retired"),
        }
    }
}

/// A rule template bound to one concrete entity.
///
/// The id is deterministic (`<template-id>_<entity-id>`) so repeated
/// expansion of the same template never creates duplicates, which is
/// what keeps the at-most-one-active-per-(lineage, entity) invariant
/// enforceable with a plain upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInstance {
    pub id: String,
    pub rule_template_id: String,
    pub rule_template_version: u32,
    pub entity_id: EntityId,
    /// Point alias → concrete point id, resolved from topology
    /// relationships at instantiation time. Aliases the entity could
    /// not satisfy are absent; the actor records a data error when it
    /// needs one.
    pub bindings: HashMap<String, PointId>,
    pub status: InstanceStatus,
    /// Optimistic concurrency version, bumped on every store write.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl RuleInstance {
    /// Deterministic instance id for a (template lineage, entity) pair.
    pub fn make_id(template_id: &str, entity_id: &str) -> String {
        format!("{}_{}", template_id, entity_id)
    }

    pub fn new(
        template_id: &str,
        template_version: u32,
        entity_id: &str,
        bindings: HashMap<String, PointId>,
    ) -> Self {
        Self {
            id: Self::make_id(template_id, entity_id),
            rule_template_id: template_id.to_string(),
            rule_template_version: template_version,
            entity_id: entity_id.to_string(),
            bindings,
            status: InstanceStatus::Pending,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether triggers should be routed to this instance.
    pub fn is_evaluatable(&self) -> bool {
        matches!(self.status, InstanceStatus::Pending | InstanceStatus::Active)
    }
}
