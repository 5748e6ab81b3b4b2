use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RuleInstanceId;

/// Durable evaluation state for one rule instance.
///
/// Single-writer: mutated only by the owning actor while resident, and
/// by nobody while evicted. Persisted after every step, before any
/// insight or command from that step is committed, so crash recovery
/// replays at most the last step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorState {
    pub rule_instance_id: RuleInstanceId,
    pub last_evaluated: Option<DateTime<Utc>>,
    /// Opaque evaluator working set, carried between steps.
    pub variables: HashMap<String, serde_json::Value>,
    /// Whether the condition held after the last successful evaluation.
    pub satisfied: bool,
    /// Open (non-Resolved) insight for this instance, if any.
    pub outstanding_insight_id: Option<String>,
    /// Outstanding Requested command per target point, for dedupe.
    pub outstanding_commands: HashMap<String, String>,
    pub trigger_count: u64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ActorState {
    pub fn fresh(rule_instance_id: &str) -> Self {
        Self {
            rule_instance_id: rule_instance_id.to_string(),
            last_evaluated: None,
            variables: HashMap::new(),
            satisfied: false,
            outstanding_insight_id: None,
            outstanding_commands: HashMap::new(),
            trigger_count: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}
