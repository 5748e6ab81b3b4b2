//! In-memory store backend for tests and local runs.
//!
//! Implements every repository trait over tokio-locked maps with the
//! same optimistic-concurrency semantics as the Postgres backend, plus
//! a failure-injection switch used by engine health tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use faultline_core::model::{
    ActorState, Command, ExecutionRequest, Insight, InstanceStatus, RequestStatus, RuleInstance,
    RuleInstanceId, RuleTemplate, TemplateId,
};

use crate::error::StorageError;
use crate::repository::{
    ActorStateRepository, CommandRepository, ExecutionRequestRepository, InsightRepository,
    RuleInstanceRepository, RuleTemplateRepository,
};

#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, RuleInstance>>,
    actor_states: RwLock<HashMap<String, ActorState>>,
    insights: RwLock<HashMap<String, Insight>>,
    commands: RwLock<HashMap<String, Command>>,
    requests: RwLock<HashMap<String, ExecutionRequest>>,
    templates: RwLock<HashMap<String, RuleTemplate>>,
    last_applied_revision: RwLock<Option<u64>>,
    /// When set, every operation fails with `Unavailable`.
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure injection for health-gate tests.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RuleInstanceRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<RuleInstance>, StorageError> {
        self.check_available()?;
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn list_by_template(
        &self,
        template_id: &str,
    ) -> Result<Vec<RuleInstance>, StorageError> {
        self.check_available()?;
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.rule_template_id == template_id)
            .cloned()
            .collect())
    }

    async fn list_by_entities(
        &self,
        entity_ids: &[String],
    ) -> Result<Vec<RuleInstance>, StorageError> {
        self.check_available()?;
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| entity_ids.contains(&i.entity_id))
            .cloned()
            .collect())
    }

    async fn list_evaluatable(&self) -> Result<Vec<RuleInstance>, StorageError> {
        self.check_available()?;
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.is_evaluatable())
            .cloned()
            .collect())
    }

    async fn update(&self, instance: &RuleInstance) -> Result<RuleInstance, StorageError> {
        self.check_available()?;
        let mut map = self.instances.write().await;
        let stored = map
            .get(&instance.id)
            .ok_or_else(|| StorageError::NotFound(instance.id.clone()))?;
        if stored.version != instance.version {
            return Err(StorageError::VersionConflict {
                entity: "rule_instance",
                id: instance.id.clone(),
                expected: instance.version,
                found: stored.version,
            });
        }
        let mut updated = instance.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        map.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn apply_expansion(
        &self,
        created: &[RuleInstance],
        retired: &[RuleInstanceId],
    ) -> Result<(), StorageError> {
        self.check_available()?;
        // Single write lock makes the whole expansion atomic.
        let mut map = self.instances.write().await;
        for instance in created {
            let mut inserted = instance.clone();
            inserted.version = map.get(&instance.id).map(|e| e.version + 1).unwrap_or(1);
            inserted.updated_at = Utc::now();
            map.insert(inserted.id.clone(), inserted);
        }
        for id in retired {
            if let Some(existing) = map.get_mut(id) {
                existing.status = InstanceStatus::Retired;
                existing.version += 1;
                existing.updated_at = Utc::now();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ActorStateRepository for MemoryStore {
    async fn load(&self, rule_instance_id: &str) -> Result<Option<ActorState>, StorageError> {
        self.check_available()?;
        Ok(self.actor_states.read().await.get(rule_instance_id).cloned())
    }

    async fn save(&self, state: &ActorState) -> Result<ActorState, StorageError> {
        self.check_available()?;
        let mut map = self.actor_states.write().await;
        if let Some(stored) = map.get(&state.rule_instance_id) {
            if stored.version != state.version {
                return Err(StorageError::VersionConflict {
                    entity: "actor_state",
                    id: state.rule_instance_id.clone(),
                    expected: state.version,
                    found: stored.version,
                });
            }
        }
        let mut saved = state.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        map.insert(saved.rule_instance_id.clone(), saved.clone());
        Ok(saved)
    }

    async fn delete(&self, rule_instance_id: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.actor_states.write().await.remove(rule_instance_id);
        Ok(())
    }
}

#[async_trait]
impl InsightRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Insight>, StorageError> {
        self.check_available()?;
        Ok(self.insights.read().await.get(id).cloned())
    }

    async fn find_open(&self, rule_instance_id: &str) -> Result<Option<Insight>, StorageError> {
        self.check_available()?;
        Ok(self
            .insights
            .read()
            .await
            .values()
            .find(|i| i.rule_instance_id == rule_instance_id && i.is_open())
            .cloned())
    }

    async fn list_by_instance(
        &self,
        rule_instance_id: &str,
    ) -> Result<Vec<Insight>, StorageError> {
        self.check_available()?;
        Ok(self
            .insights
            .read()
            .await
            .values()
            .filter(|i| i.rule_instance_id == rule_instance_id)
            .cloned()
            .collect())
    }

    async fn upsert(&self, insight: &Insight) -> Result<Insight, StorageError> {
        self.check_available()?;
        let mut map = self.insights.write().await;
        if let Some(stored) = map.get(&insight.id) {
            if stored.version != insight.version {
                return Err(StorageError::VersionConflict {
                    entity: "insight",
                    id: insight.id.clone(),
                    expected: insight.version,
                    found: stored.version,
                });
            }
        }
        let mut saved = insight.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        map.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }
}

#[async_trait]
impl CommandRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Command>, StorageError> {
        self.check_available()?;
        Ok(self.commands.read().await.get(id).cloned())
    }

    async fn find_requested(
        &self,
        rule_instance_id: &str,
        target_point_id: &str,
    ) -> Result<Option<Command>, StorageError> {
        self.check_available()?;
        Ok(self
            .commands
            .read()
            .await
            .values()
            .find(|c| {
                c.rule_instance_id == rule_instance_id
                    && c.target_point_id == target_point_id
                    && c.status == faultline_core::model::CommandStatus::Requested
            })
            .cloned())
    }

    async fn upsert(&self, command: &Command) -> Result<Command, StorageError> {
        self.check_available()?;
        let mut map = self.commands.write().await;
        if let Some(stored) = map.get(&command.id) {
            if stored.version != command.version {
                return Err(StorageError::VersionConflict {
                    entity: "command",
                    id: command.id.clone(),
                    expected: command.version,
                    found: stored.version,
                });
            }
        }
        let mut saved = command.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        map.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }
}

#[async_trait]
impl ExecutionRequestRepository for MemoryStore {
    async fn insert(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionRequest, StorageError> {
        self.check_available()?;
        let mut req = request.clone();
        req.version = 1;
        self.requests
            .write()
            .await
            .insert(req.id.clone(), req.clone());
        Ok(req)
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRequest>, StorageError> {
        self.check_available()?;
        Ok(self.requests.read().await.get(id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<ExecutionRequest>, StorageError> {
        self.check_available()?;
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: &str,
        expected_version: i64,
        status: RequestStatus,
        attempts: u32,
    ) -> Result<ExecutionRequest, StorageError> {
        self.check_available()?;
        let mut map = self.requests.write().await;
        let stored = map
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if stored.version != expected_version {
            return Err(StorageError::VersionConflict {
                entity: "execution_request",
                id: id.to_string(),
                expected: expected_version,
                found: stored.version,
            });
        }
        stored.status = status;
        stored.attempts = attempts;
        stored.version += 1;
        Ok(stored.clone())
    }
}

#[async_trait]
impl RuleTemplateRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<RuleTemplate>, StorageError> {
        self.check_available()?;
        Ok(self.templates.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<RuleTemplate>, StorageError> {
        self.check_available()?;
        Ok(self.templates.read().await.values().cloned().collect())
    }

    async fn upsert(&self, template: &RuleTemplate) -> Result<(), StorageError> {
        self.check_available()?;
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn delete(&self, id: &TemplateId) -> Result<(), StorageError> {
        self.check_available()?;
        self.templates.write().await.remove(id);
        Ok(())
    }

    async fn last_applied_revision(&self) -> Result<Option<u64>, StorageError> {
        self.check_available()?;
        Ok(*self.last_applied_revision.read().await)
    }

    async fn set_last_applied_revision(&self, revision: u64) -> Result<(), StorageError> {
        self.check_available()?;
        *self.last_applied_revision.write().await = Some(revision);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn test_actor_state_version_conflict() {
        let store = MemoryStore::new();
        let state = ActorState::fresh("r1_e1");

        let saved = store.save(&state).await.unwrap();
        assert_eq!(saved.version, 1);

        // Writing back the stale version 0 copy must conflict.
        let err = store.save(&state).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));

        // Writing the fresh copy succeeds.
        let saved2 = store.save(&saved).await.unwrap();
        assert_eq!(saved2.version, 2);
    }

    #[tokio::test]
    async fn test_expansion_creates_and_retires_atomically() {
        let store = MemoryStore::new();
        let a = RuleInstance::new("r1", 1, "e1", StdHashMap::new());
        store.apply_expansion(&[a.clone()], &[]).await.unwrap();

        let b = RuleInstance::new("r1", 2, "e2", StdHashMap::new());
        store
            .apply_expansion(&[b], &[a.id.clone()])
            .await
            .unwrap();

        let a_after = RuleInstanceRepository::get(&store, &a.id).await.unwrap().unwrap();
        assert_eq!(a_after.status, InstanceStatus::Retired);
        let evaluatable = store.list_evaluatable().await.unwrap();
        assert_eq!(evaluatable.len(), 1);
        assert_eq!(evaluatable[0].entity_id, "e2");
    }

    #[tokio::test]
    async fn test_find_open_insight() {
        let store = MemoryStore::new();
        let mut insight = Insight::open(
            "r1_e1",
            "e1",
            Utc::now(),
            "x".into(),
            1,
            serde_json::json!({}),
        );
        let saved = InsightRepository::upsert(&store, &insight).await.unwrap();
        assert!(InsightRepository::find_open(&store, "r1_e1")
            .await
            .unwrap()
            .is_some());

        insight = saved;
        insight.resolve(Utc::now());
        InsightRepository::upsert(&store, &insight).await.unwrap();
        assert!(InsightRepository::find_open(&store, "r1_e1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unavailable_injection() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.load("r1_e1").await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        store.set_unavailable(false);
        assert!(store.load("r1_e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_status_cas() {
        let store = MemoryStore::new();
        let req = ExecutionRequest::realtime_tick();
        store.insert(&req).await.unwrap();

        let updated = store
            .update_status(&req.id, 1, RequestStatus::InProgress, 1)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .update_status(&req.id, 1, RequestStatus::Completed, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
    }
}
