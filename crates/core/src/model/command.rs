use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, EntityId, PointId, RuleInstanceId};

/// Delivery status of a remediation command. Transitions past
/// `Requested` are owned by the external command dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Requested,
    Sent,
    Acknowledged,
    Failed,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Requested => write!(f, "Requested"),
            CommandStatus::Sent => write!(f, "Sent"),
            CommandStatus::Acknowledged => write!(f, "Acknowledged"),
            CommandStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// A requested remediation action derived from rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub rule_instance_id: RuleInstanceId,
    pub entity_id: EntityId,
    pub target_point_id: PointId,
    pub requested_value: f64,
    pub status: CommandStatus,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    pub fn request(
        rule_instance_id: &str,
        entity_id: &str,
        target_point_id: &str,
        requested_value: f64,
    ) -> Self {
        Self {
            id: new_id(),
            rule_instance_id: rule_instance_id.to_string(),
            entity_id: entity_id.to_string(),
            target_point_id: target_point_id.to_string(),
            requested_value,
            status: CommandStatus::Requested,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}
