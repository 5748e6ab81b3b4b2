//! Actor manager: residency, hydration, dispatch and eviction.
//!
//! Actors are hydrated lazily from persisted state the first time a
//! request targets their instance, held in an LRU cache bounded by
//! `max_resident_actors`, and stepped under a shared semaphore that
//! caps parallel evaluations. Each actor is stepped behind its own
//! mutex, so per-instance evaluation stays single-writer even when a
//! request fans out across the pool.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lru::LruCache;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use faultline_core::config::EngineConfig;
use faultline_core::model::{
    ExecutionRequest, InstanceStatus, PointId, RequestKind, RequestScope, RuleInstance,
    RuleInstanceId,
};
use faultline_rules::EvaluatorProvider;
use faultline_storage::{Store, StorageError};
use faultline_timeseries::TimeSeriesStore;

use crate::actor::{Actor, CancelFlag};
use crate::error::EngineError;
use crate::metrics::EngineMetrics;

/// Aggregate of what one request's dispatch did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub actors: usize,
    pub evaluated: usize,
    pub skipped: usize,
    pub insights_opened: usize,
    pub insights_resolved: usize,
    pub commands_requested: usize,
}

#[derive(Debug, Default)]
struct ActorRunStats {
    evaluated: usize,
    skipped: usize,
    insights_opened: usize,
    insights_resolved: usize,
    commands_requested: usize,
}

pub struct ActorManager {
    store: Store,
    series: Arc<TimeSeriesStore>,
    provider: Arc<EvaluatorProvider>,
    config: EngineConfig,
    residents: Mutex<LruCache<RuleInstanceId, Arc<Mutex<Actor>>>>,
    /// Residents whose instance stopped being evaluatable, with the
    /// time we noticed; removed after the grace period.
    retiring: Mutex<HashMap<RuleInstanceId, Instant>>,
    pool: Arc<Semaphore>,
    cancel: CancelFlag,
    consecutive_store_failures: AtomicU32,
    metrics: Arc<EngineMetrics>,
}

impl ActorManager {
    pub fn new(
        store: Store,
        series: Arc<TimeSeriesStore>,
        provider: Arc<EvaluatorProvider>,
        config: EngineConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_resident_actors.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let pool = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            store,
            series,
            provider,
            config,
            residents: Mutex::new(LruCache::new(capacity)),
            retiring: Mutex::new(HashMap::new()),
            pool,
            cancel: CancelFlag::default(),
            consecutive_store_failures: AtomicU32::new(0),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Shared step-concurrency semaphore, exposed for the orchestrator
    /// and for saturation tests.
    pub fn worker_pool(&self) -> Arc<Semaphore> {
        self.pool.clone()
    }

    /// Signal in-flight steps to abandon at their pre-persistence
    /// check; abandoned requests stay Pending and retry on restart.
    pub fn begin_shutdown(&self) {
        self.cancel.cancel();
    }

    /// False after `store_failure_threshold` consecutive store
    /// failures; dispatch probes the store and resets on recovery.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_store_failures.load(Ordering::Relaxed)
            < self.config.store_failure_threshold
    }

    pub async fn resident_count(&self) -> usize {
        self.residents.lock().await.len()
    }

    /// Evaluate every instance the request targets.
    ///
    /// Retryable failures (store outage, saturated pool) come back as
    /// errors so the orchestrator can re-queue the request; the summary
    /// is only returned for a fully processed dispatch.
    pub async fn dispatch(&self, request: &ExecutionRequest) -> Result<DispatchSummary, EngineError> {
        if !self.is_healthy() {
            // Probe before resuming: one cheap read decides whether the
            // store is back.
            if let Err(e) = self.store.instances.list_evaluatable().await {
                warn!(error = %e, "store still unavailable, evaluation suspended");
                return Err(EngineError::Unhealthy);
            }
            info!("store recovered, resuming evaluation");
            self.consecutive_store_failures.store(0, Ordering::Relaxed);
        }

        // A realtime tick consumes the touched-point set. Until the
        // dispatch runs to completion the set is still owed to this
        // request: any failure puts it back so the re-queued retry
        // evaluates the samples that triggered the tick.
        let touched = match request.kind {
            RequestKind::RealtimeTick => Some(self.series.take_touched()),
            _ => None,
        };

        let targets = match self.resolve_targets(request, touched.as_ref()).await {
            Ok(targets) => targets,
            Err(e) => {
                if let Some(points) = touched {
                    self.series.restore_touched(points);
                }
                self.note_store_result(&e);
                return Err(e);
            }
        };

        let mut summary = DispatchSummary {
            actors: targets.len(),
            ..Default::default()
        };

        let results: Vec<Result<ActorRunStats, EngineError>> = stream::iter(targets)
            .map(|(instance, triggers)| self.run_actor(instance, triggers))
            .buffer_unordered(self.config.worker_pool_size.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(stats) => {
                    summary.evaluated += stats.evaluated;
                    summary.skipped += stats.skipped;
                    summary.insights_opened += stats.insights_opened;
                    summary.insights_resolved += stats.insights_resolved;
                    summary.commands_requested += stats.commands_requested;
                }
                Err(e) => {
                    self.note_store_result(&e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            // Fully evaluated actors will skip on the retry via their
            // trigger cursor, so restoring everything is safe.
            if let Some(points) = touched {
                self.series.restore_touched(points);
            }
            return Err(e);
        }

        self.consecutive_store_failures.store(0, Ordering::Relaxed);
        self.sweep_retired().await;
        Ok(summary)
    }

    /// Instances the request covers, each with the ordered trigger
    /// timestamps to step through.
    async fn resolve_targets(
        &self,
        request: &ExecutionRequest,
        touched: Option<&HashSet<PointId>>,
    ) -> Result<Vec<(RuleInstance, Vec<DateTime<Utc>>)>, EngineError> {
        let instances = match &request.scope {
            RequestScope::All => self.store.instances.list_evaluatable().await?,
            RequestScope::Entities(ids) => self
                .store
                .instances
                .list_by_entities(ids)
                .await?
                .into_iter()
                .filter(|i| i.is_evaluatable())
                .collect(),
        };

        let mut targets = Vec::new();
        match &request.kind {
            RequestKind::RealtimeTick => {
                let Some(touched) = touched.filter(|t| !t.is_empty()) else {
                    return Ok(targets);
                };
                for instance in instances {
                    if !instance.bindings.values().any(|p| touched.contains(p)) {
                        continue;
                    }
                    if let Some(as_of) = self.latest_data_ts(&instance) {
                        targets.push((instance, vec![as_of]));
                    }
                }
            }
            RequestKind::RuleChanged { rule_template_id } => {
                for instance in instances {
                    if &instance.rule_template_id != rule_template_id {
                        continue;
                    }
                    // The template changed under the instance: drop the
                    // resident actor and its persisted state so the new
                    // version starts from a clean working set.
                    self.evict(&instance.id).await;
                    self.store.actor_states.delete(&instance.id).await?;
                    if let Some(as_of) = self.latest_data_ts(&instance) {
                        targets.push((instance, vec![as_of]));
                    }
                }
            }
            RequestKind::Backfill { start, end } => {
                for instance in instances {
                    let mut stamps: Vec<DateTime<Utc>> = instance
                        .bindings
                        .values()
                        .flat_map(|p| self.series.range(p, *start, *end))
                        .map(|v| v.timestamp)
                        .collect();
                    stamps.sort();
                    stamps.dedup();
                    if !stamps.is_empty() {
                        targets.push((instance, stamps));
                    }
                }
            }
        }
        Ok(targets)
    }

    /// Newest buffered timestamp across the instance's bound points.
    fn latest_data_ts(&self, instance: &RuleInstance) -> Option<DateTime<Utc>> {
        instance
            .bindings
            .values()
            .filter_map(|p| self.series.snapshot(p, DateTime::<Utc>::MAX_UTC))
            .map(|s| s.last.timestamp)
            .max()
    }

    async fn run_actor(
        &self,
        instance: RuleInstance,
        triggers: Vec<DateTime<Utc>>,
    ) -> Result<ActorRunStats, EngineError> {
        let _permit = timeout(self.config.dispatch_timeout, self.pool.acquire())
            .await
            .map_err(|_| EngineError::Busy)?
            .map_err(|_| EngineError::Busy)?;

        let Some(handle) = self.resident(&instance).await? else {
            return Ok(ActorRunStats::default());
        };
        let mut actor = handle.lock().await;
        actor.set_instance(instance.clone());

        let mut stats = ActorRunStats::default();
        for as_of in triggers {
            let step = actor
                .step(
                    as_of,
                    &self.series,
                    &self.store,
                    self.config.max_occurrences,
                    &self.cancel,
                )
                .await?;
            if step.evaluated {
                stats.evaluated += 1;
                self.metrics.record_step();
            } else {
                stats.skipped += 1;
                self.metrics.record_skip();
            }
            if step.insight_opened {
                stats.insights_opened += 1;
                self.metrics.record_insight_opened();
            }
            if step.insight_resolved {
                stats.insights_resolved += 1;
                self.metrics.record_insight_resolved();
            }
            if step.command_requested {
                stats.commands_requested += 1;
                self.metrics.record_command();
            }
        }

        if stats.evaluated > 0 && actor.instance().status == InstanceStatus::Pending {
            self.activate(&mut actor).await?;
        }
        Ok(stats)
    }

    /// First successful evaluation flips Pending → Active.
    async fn activate(&self, actor: &mut Actor) -> Result<(), EngineError> {
        let mut instance = actor.instance().clone();
        instance.status = InstanceStatus::Active;
        match self.store.instances.update(&instance).await {
            Ok(updated) => {
                actor.set_instance(updated);
                Ok(())
            }
            Err(StorageError::VersionConflict { .. }) => {
                // Someone else moved the instance; take their version.
                if let Some(current) = self.store.instances.get(&instance.id).await? {
                    actor.set_instance(current);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resident actor for the instance, hydrating from persisted state
    /// if needed. `None` when the template or evaluator cannot be
    /// resolved (the instance is skipped, not failed).
    async fn resident(
        &self,
        instance: &RuleInstance,
    ) -> Result<Option<Arc<Mutex<Actor>>>, EngineError> {
        if let Some(handle) = self.residents.lock().await.get(&instance.id) {
            return Ok(Some(handle.clone()));
        }

        let Some(template) = self.store.templates.get(&instance.rule_template_id).await? else {
            warn!(
                rule_instance_id = %instance.id,
                rule_template_id = %instance.rule_template_id,
                "template missing for instance, skipping"
            );
            return Ok(None);
        };
        let Some(evaluator) = self.provider.resolve(&template.expression_ref) else {
            warn!(
                rule_instance_id = %instance.id,
                expression_ref = %template.expression_ref,
                "no evaluator registered, skipping"
            );
            return Ok(None);
        };

        let state = self
            .store
            .actor_states
            .load(&instance.id)
            .await?
            .unwrap_or_else(|| {
                debug!(rule_instance_id = %instance.id, "no persisted state, starting fresh");
                faultline_core::model::ActorState::fresh(&instance.id)
            });

        let actor = Arc::new(Mutex::new(Actor::new(
            instance.clone(),
            evaluator,
            template.params,
            state,
        )));
        // push may LRU-evict an idle actor; its state is already
        // persisted, so it simply rehydrates on next use.
        self.residents
            .lock()
            .await
            .push(instance.id.clone(), actor.clone());
        Ok(Some(actor))
    }

    async fn evict(&self, instance_id: &str) {
        self.residents.lock().await.pop(instance_id);
        self.retiring.lock().await.remove(instance_id);
    }

    /// Remove residents whose instance stopped being evaluatable, after
    /// the grace period. Retired (or deleted) instances also lose their
    /// persisted state; disabled instances keep it so a resume picks up
    /// where the pause left off.
    async fn sweep_retired(&self) {
        let ids: Vec<RuleInstanceId> = {
            let residents = self.residents.lock().await;
            residents.iter().map(|(id, _)| id.clone()).collect()
        };

        for id in ids {
            let status = match self.store.instances.get(&id).await {
                Ok(Some(instance)) => Some(instance.status),
                Ok(None) => None,
                Err(e) => {
                    debug!(rule_instance_id = %id, error = %e, "sweep read failed");
                    continue;
                }
            };

            let mut retiring = self.retiring.lock().await;
            if matches!(status, Some(InstanceStatus::Pending | InstanceStatus::Active)) {
                retiring.remove(&id);
                continue;
            }
            let since = *retiring.entry(id.clone()).or_insert_with(Instant::now);
            if since.elapsed() < self.config.eviction_grace {
                continue;
            }
            retiring.remove(&id);
            drop(retiring);
            self.residents.lock().await.pop(&id);
            if status == Some(InstanceStatus::Disabled) {
                info!(rule_instance_id = %id, "disabled actor evicted, state kept");
                continue;
            }
            if let Err(e) = self.store.actor_states.delete(&id).await {
                warn!(rule_instance_id = %id, error = %e, "failed to delete retired actor state");
            }
            info!(rule_instance_id = %id, "retired actor evicted");
        }
    }

    fn note_store_result(&self, error: &EngineError) {
        if matches!(error, EngineError::Store(e) if e.is_transient()) {
            let n = self
                .consecutive_store_failures
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            if n >= self.config.store_failure_threshold {
                warn!(consecutive_failures = n, "store failure threshold reached");
            }
        }
    }
}
