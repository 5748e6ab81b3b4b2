//! Execution engine for faultline: stateful evaluation actors, the
//! actor manager, and the request orchestrator.
//!
//! Data path: samples arrive through the ingress channel into the
//! time-series store; the tick scheduler enqueues realtime requests;
//! the orchestrator drains the queue realtime-first and fans requests
//! out to actors through the manager's bounded worker pool; actors
//! persist state before committing insights and commands.

pub mod actor;
pub mod error;
pub mod ingress;
pub mod manager;
pub mod metrics;
pub mod orchestrator;

pub use actor::{Actor, CancelFlag, StepOutcome};
pub use error::EngineError;
pub use ingress::{feed_jsonl, sample_channel, IngressLoop, SampleIngress, TickScheduler};
pub use manager::{ActorManager, DispatchSummary};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use orchestrator::Orchestrator;
