use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, EntityId, RuleInstanceId};

/// Lifecycle state of an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightState {
    /// Condition became satisfied; not yet seen by anyone downstream.
    New,
    /// Condition re-confirmed on a later trigger.
    Active,
    /// Condition cleared.
    Resolved,
    /// Suppressed by an operator; kept for audit.
    Ignored,
}

impl fmt::Display for InsightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsightState::New => write!(f, "New"),
            InsightState::Active => write!(f, "Active"),
            InsightState::Resolved => write!(f, "Resolved"),
            InsightState::Ignored => write!(f, "Ignored"),
        }
    }
}

/// One contiguous interval during which the condition held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightOccurrence {
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
}

/// A persisted record that a rule's condition became true for an entity.
///
/// De-duplication invariant: at most one non-Resolved insight exists per
/// rule instance — repeated firings update the open record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub rule_instance_id: RuleInstanceId,
    pub entity_id: EntityId,
    pub state: InsightState,
    /// Human-readable summary rendered by the evaluator.
    pub text: String,
    pub priority: i32,
    pub first_occurred: DateTime<Utc>,
    pub last_occurred: DateTime<Utc>,
    /// Evaluator-supplied supporting values at the time of firing.
    pub evidence: serde_json::Value,
    /// Bounded history of faulted intervals, newest last.
    pub occurrences: Vec<InsightOccurrence>,
    /// Number of triggers that confirmed the condition.
    pub trigger_count: u64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Insight {
    pub fn open(
        rule_instance_id: &str,
        entity_id: &str,
        at: DateTime<Utc>,
        text: String,
        priority: i32,
        evidence: serde_json::Value,
    ) -> Self {
        Self {
            id: new_id(),
            rule_instance_id: rule_instance_id.to_string(),
            entity_id: entity_id.to_string(),
            state: InsightState::New,
            text,
            priority,
            first_occurred: at,
            last_occurred: at,
            evidence,
            occurrences: vec![InsightOccurrence {
                started: at,
                ended: at,
            }],
            trigger_count: 1,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Record a repeat firing: New → Active, extend the open occurrence.
    pub fn confirm(&mut self, at: DateTime<Utc>, evidence: serde_json::Value, max_occurrences: usize) {
        if self.state == InsightState::New {
            self.state = InsightState::Active;
        }
        self.last_occurred = at;
        self.evidence = evidence;
        self.trigger_count += 1;
        if let Some(last) = self.occurrences.last_mut() {
            last.ended = at;
        }
        if self.occurrences.len() > max_occurrences {
            let excess = self.occurrences.len() - max_occurrences;
            self.occurrences.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    /// The condition cleared.
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.state = InsightState::Resolved;
        if let Some(last) = self.occurrences.last_mut() {
            last.ended = at;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, InsightState::Resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_confirm_resolve_lifecycle() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(60);
        let t2 = t0 + chrono::Duration::seconds(120);

        let mut insight = Insight::open("r1_e1", "e1", t0, "too hot".into(), 3, serde_json::json!({}));
        assert_eq!(insight.state, InsightState::New);
        assert_eq!(insight.first_occurred, t0);
        assert_eq!(insight.trigger_count, 1);

        insight.confirm(t1, serde_json::json!({"value": 91.0}), 10);
        assert_eq!(insight.state, InsightState::Active);
        assert_eq!(insight.first_occurred, t0);
        assert_eq!(insight.last_occurred, t1);
        assert_eq!(insight.trigger_count, 2);

        insight.resolve(t2);
        assert_eq!(insight.state, InsightState::Resolved);
        assert!(!insight.is_open());
        assert_eq!(insight.occurrences.len(), 1);
        assert_eq!(insight.occurrences[0].ended, t2);
    }

    #[test]
    fn test_occurrence_history_is_bounded() {
        let t0 = Utc::now();
        let mut insight = Insight::open("r1_e1", "e1", t0, "x".into(), 1, serde_json::json!({}));
        for i in 0..20 {
            insight.occurrences.push(InsightOccurrence {
                started: t0,
                ended: t0 + chrono::Duration::seconds(i),
            });
        }
        insight.confirm(t0 + chrono::Duration::seconds(30), serde_json::json!({}), 5);
        assert_eq!(insight.occurrences.len(), 5);
    }
}
