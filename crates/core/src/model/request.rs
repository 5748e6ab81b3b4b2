use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, EntityId, TemplateId};

/// What a queued execution request asks the engine to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Evaluate instances touched by new samples since the last tick.
    RealtimeTick,
    /// Replay buffered history through the actors in timestamp order.
    Backfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Re-evaluate after a template change.
    RuleChanged { rule_template_id: TemplateId },
}

impl RequestKind {
    /// Realtime ticks are drained before everything else.
    pub fn is_realtime(&self) -> bool {
        matches!(self, RequestKind::RealtimeTick)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::RealtimeTick => write!(f, "RealtimeTick"),
            RequestKind::Backfill { .. } => write!(f, "Backfill"),
            RequestKind::RuleChanged { rule_template_id } => {
                write!(f, "RuleChanged({})", rule_template_id)
            }
        }
    }
}

/// Which rule instances a request covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestScope {
    /// All evaluatable instances.
    All,
    /// Instances bound to the listed entities.
    Entities(Vec<EntityId>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    /// Retries exhausted; reason is operator-visible.
    Failed { reason: String },
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "Pending"),
            RequestStatus::InProgress => write!(f, "InProgress"),
            RequestStatus::Completed => write!(f, "Completed"),
            RequestStatus::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

/// Durable queue entry consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    pub kind: RequestKind,
    pub scope: RequestScope,
    pub status: RequestStatus,
    /// Dispatch attempts so far; bounded by config `max_attempts`.
    pub attempts: u32,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub version: i64,
}

impl ExecutionRequest {
    pub fn new(kind: RequestKind, scope: RequestScope, requested_by: &str) -> Self {
        Self {
            id: new_id(),
            kind,
            scope,
            status: RequestStatus::Pending,
            attempts: 0,
            requested_by: requested_by.to_string(),
            requested_at: Utc::now(),
            version: 0,
        }
    }

    pub fn realtime_tick() -> Self {
        Self::new(RequestKind::RealtimeTick, RequestScope::All, "scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_priority_flag() {
        assert!(ExecutionRequest::realtime_tick().kind.is_realtime());
        let backfill = ExecutionRequest::new(
            RequestKind::Backfill {
                start: Utc::now(),
                end: Utc::now(),
            },
            RequestScope::All,
            "operator",
        );
        assert!(!backfill.kind.is_realtime());
    }

    #[test]
    fn test_request_serde_roundtrip() {
        let req = ExecutionRequest::new(
            RequestKind::RuleChanged {
                rule_template_id: "r1".to_string(),
            },
            RequestScope::Entities(vec!["e1".to_string()]),
            "reconciler",
        );
        let json = serde_json::to_string(&req).unwrap();
        let back: ExecutionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, req.kind);
        assert_eq!(back.scope, req.scope);
        assert_eq!(back.status, RequestStatus::Pending);
    }
}
