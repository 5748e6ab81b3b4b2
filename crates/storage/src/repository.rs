//! Repository traits the engine consumes.
//!
//! Every write that transitions a status goes through a
//! read-then-conditionally-write path: the caller passes the version it
//! read and the store rejects the write with
//! [`StorageError::VersionConflict`] if someone else got there first.

use std::sync::Arc;

use async_trait::async_trait;

use faultline_core::model::{
    ActorState, Command, ExecutionRequest, Insight, RequestStatus, RuleInstance, RuleInstanceId,
    RuleTemplate, TemplateId,
};

use crate::error::StorageError;
use crate::sink::ChangeFeed;

#[async_trait]
pub trait RuleInstanceRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<RuleInstance>, StorageError>;

    async fn list_by_template(&self, template_id: &str)
        -> Result<Vec<RuleInstance>, StorageError>;

    async fn list_by_entities(&self, entity_ids: &[String])
        -> Result<Vec<RuleInstance>, StorageError>;

    /// All Pending/Active instances.
    async fn list_evaluatable(&self) -> Result<Vec<RuleInstance>, StorageError>;

    /// Write back an instance read earlier; compares versions and bumps
    /// on success.
    async fn update(&self, instance: &RuleInstance) -> Result<RuleInstance, StorageError>;

    /// Commit one template expansion atomically: either every created
    /// instance is inserted and every retired one flipped, or nothing.
    async fn apply_expansion(
        &self,
        created: &[RuleInstance],
        retired: &[RuleInstanceId],
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ActorStateRepository: Send + Sync {
    async fn load(&self, rule_instance_id: &str) -> Result<Option<ActorState>, StorageError>;

    /// Persist, bumping the version. Must complete before insights or
    /// commands from the same step are committed.
    async fn save(&self, state: &ActorState) -> Result<ActorState, StorageError>;

    async fn delete(&self, rule_instance_id: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait InsightRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Insight>, StorageError>;

    /// The single non-Resolved insight for an instance, if one exists.
    async fn find_open(&self, rule_instance_id: &str) -> Result<Option<Insight>, StorageError>;

    async fn list_by_instance(&self, rule_instance_id: &str)
        -> Result<Vec<Insight>, StorageError>;

    async fn upsert(&self, insight: &Insight) -> Result<Insight, StorageError>;
}

#[async_trait]
pub trait CommandRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Command>, StorageError>;

    /// Outstanding Requested command for (instance, target point), for
    /// dedupe at the actor.
    async fn find_requested(
        &self,
        rule_instance_id: &str,
        target_point_id: &str,
    ) -> Result<Option<Command>, StorageError>;

    async fn upsert(&self, command: &Command) -> Result<Command, StorageError>;
}

#[async_trait]
pub trait ExecutionRequestRepository: Send + Sync {
    /// Persist a new request; returns the stored copy with its initial
    /// version set.
    async fn insert(&self, request: &ExecutionRequest)
        -> Result<ExecutionRequest, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<ExecutionRequest>, StorageError>;

    /// All Pending requests, for queue restore after a restart and for
    /// picking up requests enqueued by other components.
    async fn list_pending(&self) -> Result<Vec<ExecutionRequest>, StorageError>;

    /// Conditional status transition on the version the caller read.
    async fn update_status(
        &self,
        id: &str,
        expected_version: i64,
        status: RequestStatus,
        attempts: u32,
    ) -> Result<ExecutionRequest, StorageError>;
}

/// Stored rule templates, tracking what the reconciler last applied.
#[async_trait]
pub trait RuleTemplateRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<RuleTemplate>, StorageError>;

    async fn list(&self) -> Result<Vec<RuleTemplate>, StorageError>;

    async fn upsert(&self, template: &RuleTemplate) -> Result<(), StorageError>;

    async fn delete(&self, id: &TemplateId) -> Result<(), StorageError>;

    /// Revision marker of the last successfully applied reconciliation.
    async fn last_applied_revision(&self) -> Result<Option<u64>, StorageError>;

    async fn set_last_applied_revision(&self, revision: u64) -> Result<(), StorageError>;
}

/// Aggregate handle passed to components — one Arc per concern, built
/// once at the composition root.
#[derive(Clone)]
pub struct Store {
    pub instances: Arc<dyn RuleInstanceRepository>,
    pub actor_states: Arc<dyn ActorStateRepository>,
    pub insights: Arc<dyn InsightRepository>,
    pub commands: Arc<dyn CommandRepository>,
    pub requests: Arc<dyn ExecutionRequestRepository>,
    pub templates: Arc<dyn RuleTemplateRepository>,
    pub feed: Arc<ChangeFeed>,
}

impl Store {
    /// Wire every repository to a single in-memory backend.
    pub fn in_memory() -> (Self, Arc<crate::memory::MemoryStore>) {
        let backend = Arc::new(crate::memory::MemoryStore::new());
        let feed = Arc::new(ChangeFeed::new(1024));
        (
            Self {
                instances: backend.clone(),
                actor_states: backend.clone(),
                insights: backend.clone(),
                commands: backend.clone(),
                requests: backend.clone(),
                templates: backend.clone(),
                feed,
            },
            backend,
        )
    }

    /// Wire every repository to a Postgres backend.
    pub fn postgres(backend: Arc<crate::postgres::PostgresStore>) -> Self {
        let feed = Arc::new(ChangeFeed::new(1024));
        Self {
            instances: backend.clone(),
            actor_states: backend.clone(),
            insights: backend.clone(),
            commands: backend.clone(),
            requests: backend.clone(),
            templates: backend,
            feed,
        }
    }
}
