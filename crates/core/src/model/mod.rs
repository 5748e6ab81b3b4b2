//! Persisted data model for the rule execution engine.

pub mod actor_state;
pub mod command;
pub mod insight;
pub mod instance;
pub mod request;
pub mod sample;
pub mod template;

pub use actor_state::ActorState;
pub use command::{Command, CommandStatus};
pub use insight::{Insight, InsightOccurrence, InsightState};
pub use instance::{InstanceStatus, RuleInstance};
pub use request::{ExecutionRequest, RequestKind, RequestScope, RequestStatus};
pub use sample::{Quality, TimeSeriesSample};
pub use template::{PointBinding, RuleTemplate};

/// String ids throughout — they come from external systems (topology
/// entity ids, git-managed template ids) or are uuid-v4 generated here.
pub type EntityId = String;
pub type PointId = String;
pub type TemplateId = String;
pub type RuleInstanceId = String;

/// Generate a fresh uuid-v4 id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
