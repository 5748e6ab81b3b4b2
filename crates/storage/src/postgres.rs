//! Postgres store backend (sqlx).
//!
//! Model structs are stored as JSON text payloads with the filterable
//! columns (status, template, entity, version) lifted out. Every
//! conditional write is `UPDATE ... WHERE version = $expected`; zero
//! rows affected means either the row vanished or someone else wrote
//! first, and we re-read to report which.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use faultline_core::model::{
    ActorState, Command, CommandStatus, ExecutionRequest, Insight, InstanceStatus, RequestStatus,
    RuleInstance, RuleInstanceId, RuleTemplate, TemplateId,
};

use crate::error::StorageError;
use crate::repository::{
    ActorStateRepository, CommandRepository, ExecutionRequestRepository, InsightRepository,
    RuleInstanceRepository, RuleTemplateRepository,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run embedded migrations.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        info!("postgres store connected, migrations applied");
        Ok(Self { pool })
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, StorageError> {
        Ok(serde_json::from_str(payload)?)
    }
}

fn status_str(status: InstanceStatus) -> String {
    status.to_string()
}

#[async_trait]
impl RuleInstanceRepository for PostgresStore {
    async fn get(&self, id: &str) -> Result<Option<RuleInstance>, StorageError> {
        let row = sqlx::query("SELECT payload FROM rule_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn list_by_template(
        &self,
        template_id: &str,
    ) -> Result<Vec<RuleInstance>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM rule_instances WHERE template_id = $1")
            .bind(template_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn list_by_entities(
        &self,
        entity_ids: &[String],
    ) -> Result<Vec<RuleInstance>, StorageError> {
        let rows =
            sqlx::query("SELECT payload FROM rule_instances WHERE entity_id = ANY($1)")
                .bind(entity_ids)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn list_evaluatable(&self) -> Result<Vec<RuleInstance>, StorageError> {
        let rows = sqlx::query(
            "SELECT payload FROM rule_instances WHERE status IN ('Pending', 'Active')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn update(&self, instance: &RuleInstance) -> Result<RuleInstance, StorageError> {
        let mut updated = instance.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        let payload = Self::encode(&updated)?;

        let result = sqlx::query(
            "UPDATE rule_instances SET payload = $1, status = $2, version = $3 \
             WHERE id = $4 AND version = $5",
        )
        .bind(&payload)
        .bind(status_str(updated.status))
        .bind(updated.version)
        .bind(&updated.id)
        .bind(instance.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found = sqlx::query("SELECT version FROM rule_instances WHERE id = $1")
                .bind(&instance.id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match found {
                Some(row) => StorageError::VersionConflict {
                    entity: "rule_instance",
                    id: instance.id.clone(),
                    expected: instance.version,
                    found: row.get::<i64, _>("version"),
                },
                None => StorageError::NotFound(instance.id.clone()),
            });
        }
        Ok(updated)
    }

    async fn apply_expansion(
        &self,
        created: &[RuleInstance],
        retired: &[RuleInstanceId],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for instance in created {
            let mut inserted = instance.clone();
            inserted.updated_at = Utc::now();
            inserted.version += 1;
            let payload = Self::encode(&inserted)?;
            sqlx::query(
                "INSERT INTO rule_instances (id, template_id, entity_id, status, version, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (id) DO UPDATE SET \
                   template_id = EXCLUDED.template_id, \
                   status = EXCLUDED.status, \
                   version = rule_instances.version + 1, \
                   payload = EXCLUDED.payload",
            )
            .bind(&inserted.id)
            .bind(&inserted.rule_template_id)
            .bind(&inserted.entity_id)
            .bind(status_str(inserted.status))
            .bind(inserted.version)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
        }

        for id in retired {
            // Flip status both in the column and inside the payload.
            if let Some(row) = sqlx::query("SELECT payload, version FROM rule_instances WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
            {
                let mut instance: RuleInstance =
                    Self::decode(row.get::<String, _>("payload").as_str())?;
                instance.status = InstanceStatus::Retired;
                instance.version = row.get::<i64, _>("version") + 1;
                instance.updated_at = Utc::now();
                let payload = Self::encode(&instance)?;
                sqlx::query(
                    "UPDATE rule_instances SET payload = $1, status = $2, version = $3 WHERE id = $4",
                )
                .bind(&payload)
                .bind(status_str(InstanceStatus::Retired))
                .bind(instance.version)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ActorStateRepository for PostgresStore {
    async fn load(&self, rule_instance_id: &str) -> Result<Option<ActorState>, StorageError> {
        let row = sqlx::query("SELECT payload FROM actor_states WHERE rule_instance_id = $1")
            .bind(rule_instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn save(&self, state: &ActorState) -> Result<ActorState, StorageError> {
        let mut saved = state.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        let payload = Self::encode(&saved)?;

        let result = sqlx::query(
            "INSERT INTO actor_states (rule_instance_id, version, payload) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (rule_instance_id) DO UPDATE SET \
               version = EXCLUDED.version, payload = EXCLUDED.payload \
             WHERE actor_states.version = $4",
        )
        .bind(&saved.rule_instance_id)
        .bind(saved.version)
        .bind(&payload)
        .bind(state.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found = sqlx::query("SELECT version FROM actor_states WHERE rule_instance_id = $1")
                .bind(&state.rule_instance_id)
                .fetch_one(&self.pool)
                .await?;
            return Err(StorageError::VersionConflict {
                entity: "actor_state",
                id: state.rule_instance_id.clone(),
                expected: state.version,
                found: found.get::<i64, _>("version"),
            });
        }
        Ok(saved)
    }

    async fn delete(&self, rule_instance_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM actor_states WHERE rule_instance_id = $1")
            .bind(rule_instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl InsightRepository for PostgresStore {
    async fn get(&self, id: &str) -> Result<Option<Insight>, StorageError> {
        let row = sqlx::query("SELECT payload FROM insights WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn find_open(&self, rule_instance_id: &str) -> Result<Option<Insight>, StorageError> {
        let row = sqlx::query(
            "SELECT payload FROM insights WHERE rule_instance_id = $1 AND open = TRUE LIMIT 1",
        )
        .bind(rule_instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn list_by_instance(
        &self,
        rule_instance_id: &str,
    ) -> Result<Vec<Insight>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM insights WHERE rule_instance_id = $1")
            .bind(rule_instance_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn upsert(&self, insight: &Insight) -> Result<Insight, StorageError> {
        let mut saved = insight.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        let payload = Self::encode(&saved)?;

        let result = sqlx::query(
            "INSERT INTO insights (id, rule_instance_id, open, version, payload) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET \
               open = EXCLUDED.open, version = EXCLUDED.version, payload = EXCLUDED.payload \
             WHERE insights.version = $6",
        )
        .bind(&saved.id)
        .bind(&saved.rule_instance_id)
        .bind(saved.is_open())
        .bind(saved.version)
        .bind(&payload)
        .bind(insight.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found = sqlx::query("SELECT version FROM insights WHERE id = $1")
                .bind(&insight.id)
                .fetch_one(&self.pool)
                .await?;
            return Err(StorageError::VersionConflict {
                entity: "insight",
                id: insight.id.clone(),
                expected: insight.version,
                found: found.get::<i64, _>("version"),
            });
        }
        Ok(saved)
    }
}

#[async_trait]
impl CommandRepository for PostgresStore {
    async fn get(&self, id: &str) -> Result<Option<Command>, StorageError> {
        let row = sqlx::query("SELECT payload FROM commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn find_requested(
        &self,
        rule_instance_id: &str,
        target_point_id: &str,
    ) -> Result<Option<Command>, StorageError> {
        let row = sqlx::query(
            "SELECT payload FROM commands \
             WHERE rule_instance_id = $1 AND target_point_id = $2 AND status = $3 LIMIT 1",
        )
        .bind(rule_instance_id)
        .bind(target_point_id)
        .bind(CommandStatus::Requested.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn upsert(&self, command: &Command) -> Result<Command, StorageError> {
        let mut saved = command.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        let payload = Self::encode(&saved)?;

        let result = sqlx::query(
            "INSERT INTO commands (id, rule_instance_id, target_point_id, status, version, payload) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
               status = EXCLUDED.status, version = EXCLUDED.version, payload = EXCLUDED.payload \
             WHERE commands.version = $7",
        )
        .bind(&saved.id)
        .bind(&saved.rule_instance_id)
        .bind(&saved.target_point_id)
        .bind(saved.status.to_string())
        .bind(saved.version)
        .bind(&payload)
        .bind(command.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found = sqlx::query("SELECT version FROM commands WHERE id = $1")
                .bind(&command.id)
                .fetch_one(&self.pool)
                .await?;
            return Err(StorageError::VersionConflict {
                entity: "command",
                id: command.id.clone(),
                expected: command.version,
                found: found.get::<i64, _>("version"),
            });
        }
        Ok(saved)
    }
}

#[async_trait]
impl ExecutionRequestRepository for PostgresStore {
    async fn insert(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionRequest, StorageError> {
        let mut req = request.clone();
        req.version = 1;
        let payload = Self::encode(&req)?;
        sqlx::query(
            "INSERT INTO execution_requests (id, status, version, payload) VALUES ($1, $2, $3, $4)",
        )
        .bind(&req.id)
        .bind(req.status.to_string())
        .bind(req.version)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(req)
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRequest>, StorageError> {
        let row = sqlx::query("SELECT payload FROM execution_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn list_pending(&self) -> Result<Vec<ExecutionRequest>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM execution_requests WHERE status = $1")
            .bind(RequestStatus::Pending.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn update_status(
        &self,
        id: &str,
        expected_version: i64,
        status: RequestStatus,
        attempts: u32,
    ) -> Result<ExecutionRequest, StorageError> {
        let current = ExecutionRequestRepository::get(self, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                entity: "execution_request",
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        let mut updated = current;
        updated.status = status;
        updated.attempts = attempts;
        updated.version += 1;
        let payload = Self::encode(&updated)?;

        let result = sqlx::query(
            "UPDATE execution_requests SET status = $1, version = $2, payload = $3 \
             WHERE id = $4 AND version = $5",
        )
        .bind(updated.status.to_string())
        .bind(updated.version)
        .bind(&payload)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::VersionConflict {
                entity: "execution_request",
                id: id.to_string(),
                expected: expected_version,
                found: updated.version,
            });
        }
        Ok(updated)
    }
}

#[async_trait]
impl RuleTemplateRepository for PostgresStore {
    async fn get(&self, id: &str) -> Result<Option<RuleTemplate>, StorageError> {
        let row = sqlx::query("SELECT payload FROM rule_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<RuleTemplate>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM rule_templates")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Self::decode(r.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn upsert(&self, template: &RuleTemplate) -> Result<(), StorageError> {
        let payload = Self::encode(template)?;
        sqlx::query(
            "INSERT INTO rule_templates (id, payload) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
        )
        .bind(&template.id)
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &TemplateId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM rule_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_applied_revision(&self) -> Result<Option<u64>, StorageError> {
        let row = sqlx::query("SELECT last_applied_revision FROM reconciler_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("last_applied_revision") as u64))
    }

    async fn set_last_applied_revision(&self, revision: u64) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO reconciler_state (id, last_applied_revision) VALUES (1, $1) \
             ON CONFLICT (id) DO UPDATE SET last_applied_revision = EXCLUDED.last_applied_revision",
        )
        .bind(revision as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
