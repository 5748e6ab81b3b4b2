//! Rule definition handling for the faultline engine.
//!
//! This crate provides:
//! - YAML-based rule template documents with serde deserialization
//! - A filesystem-backed rule repository with a content-derived
//!   revision marker
//! - Template validation with structured errors and warnings
//! - The evaluator provider and built-in evaluators (threshold, delta,
//!   absence)
//! - Topology-driven rule instantiation (template → per-entity
//!   instances)
//! - The git-sync reconciler that diffs the repository against stored
//!   templates and drives the instantiator

pub mod error;
pub mod evaluator;
pub mod instantiator;
pub mod reconciler;
pub mod repository;
pub mod schema;
pub mod topology;
pub mod validation;

pub use error::RulesError;
pub use evaluator::{EvalInput, EvalOutcome, Evaluator, EvaluatorProvider};
pub use instantiator::{Expansion, RuleInstantiator};
pub use reconciler::{Conflict, ReconcileReport, Reconciler, TemplateChange};
pub use repository::{FsRuleRepository, RuleRepository};
pub use schema::TemplateDoc;
pub use topology::{Relationship, StaticTopology, TopologyQuery};
pub use validation::{ValidationIssue, ValidationResult};
