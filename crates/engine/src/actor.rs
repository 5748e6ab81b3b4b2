//! Evaluation actor: one rule instance's stateful step logic.
//!
//! An actor owns its [`ActorState`] exclusively while resident (the
//! manager serializes steps per instance), so every mutation here can
//! assume single-writer semantics. The durable ordering contract: the
//! state is persisted first, then the step's insight and command
//! effects are committed. A crash in between re-runs at most one step,
//! and evaluation is deterministic on `(state, snapshots, as_of)`, so
//! the replay converges on the same effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use faultline_core::model::{ActorState, Command, CommandStatus, Insight, RuleInstance};
use faultline_rules::evaluator::{EvalInput, Evaluator};
use faultline_storage::Store;
use faultline_timeseries::{PointSnapshot, TimeSeriesStore};

use crate::error::EngineError;

/// Cooperative cancellation signal shared by the manager and every
/// in-flight step.
///
/// A step checks it between the evaluator call and persistence: if
/// raised, the step is abandoned with no side effects and the request
/// retries; once persistence has begun the step runs to completion.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one step did, for metrics and request summaries.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub evaluated: bool,
    pub insight_opened: bool,
    pub insight_resolved: bool,
    pub command_requested: bool,
    pub skip_reason: Option<String>,
}

enum InsightAction {
    None,
    Upsert(Insight),
}

pub struct Actor {
    instance: RuleInstance,
    evaluator: Arc<dyn Evaluator>,
    params: serde_json::Value,
    state: ActorState,
}

impl Actor {
    pub fn new(
        instance: RuleInstance,
        evaluator: Arc<dyn Evaluator>,
        params: serde_json::Value,
        state: ActorState,
    ) -> Self {
        Self {
            instance,
            evaluator,
            params,
            state,
        }
    }

    pub fn instance(&self) -> &RuleInstance {
        &self.instance
    }

    pub fn state(&self) -> &ActorState {
        &self.state
    }

    /// Replace the instance record after a store refresh (status or
    /// binding changes picked up between steps).
    pub fn set_instance(&mut self, instance: RuleInstance) {
        self.instance = instance;
    }

    /// Evaluate once at `as_of`.
    ///
    /// Triggers at or before `last_evaluated` are skips, which is what
    /// makes re-delivered requests and backfill overlap idempotent.
    pub async fn step(
        &mut self,
        as_of: DateTime<Utc>,
        series: &TimeSeriesStore,
        store: &Store,
        max_occurrences: usize,
        cancel: &CancelFlag,
    ) -> Result<StepOutcome, EngineError> {
        if let Some(last) = self.state.last_evaluated {
            if as_of <= last {
                debug!(
                    rule_instance_id = %self.instance.id,
                    as_of = %as_of,
                    last_evaluated = %last,
                    "trigger already evaluated, skipping"
                );
                return Ok(StepOutcome {
                    skip_reason: Some("already evaluated".to_string()),
                    ..Default::default()
                });
            }
        }

        let snapshots = self.gather_snapshots(as_of, series);
        let input = EvalInput {
            variables: &self.state.variables,
            snapshots: &snapshots,
            params: &self.params,
            as_of,
        };

        let evaluated = self.evaluator.evaluate(&input);
        // Nothing has been persisted yet: an abandoned step here has
        // no side effects and the request can simply retry.
        if cancel.is_cancelled() {
            debug!(
                rule_instance_id = %self.instance.id,
                as_of = %as_of,
                "step cancelled before persistence, abandoning"
            );
            return Err(EngineError::Cancelled);
        }

        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(reason) => {
                // Evaluation failures (usually missing data) leave the
                // working set untouched; only the trigger cursor moves.
                warn!(
                    rule_instance_id = %self.instance.id,
                    as_of = %as_of,
                    reason = %reason,
                    "evaluation skipped"
                );
                let mut next = self.state.clone();
                next.last_evaluated = Some(as_of);
                next.updated_at = Utc::now();
                self.state = store.actor_states.save(&next).await?;
                return Ok(StepOutcome {
                    skip_reason: Some(reason),
                    ..Default::default()
                });
            }
        };

        let mut next = self.state.clone();
        next.variables = outcome.variables;
        next.satisfied = outcome.satisfied;
        next.last_evaluated = Some(as_of);
        next.updated_at = Utc::now();
        if outcome.satisfied {
            next.trigger_count += 1;
        }

        let mut step = StepOutcome {
            evaluated: true,
            ..Default::default()
        };

        // Decide the insight effect before persisting the state so the
        // dedupe hint saved with the state matches what gets committed.
        let open = self.find_open_insight(store).await?;
        let insight_action = if outcome.satisfied {
            match open {
                Some(mut insight) => {
                    insight.confirm(as_of, outcome.evidence, max_occurrences);
                    next.outstanding_insight_id = Some(insight.id.clone());
                    InsightAction::Upsert(insight)
                }
                None => {
                    let insight = Insight::open(
                        &self.instance.id,
                        &self.instance.entity_id,
                        as_of,
                        outcome.text,
                        outcome.priority,
                        outcome.evidence,
                    );
                    next.outstanding_insight_id = Some(insight.id.clone());
                    step.insight_opened = true;
                    InsightAction::Upsert(insight)
                }
            }
        } else {
            match open {
                Some(mut insight) => {
                    insight.resolve(as_of);
                    next.outstanding_insight_id = None;
                    step.insight_resolved = true;
                    InsightAction::Upsert(insight)
                }
                None => {
                    next.outstanding_insight_id = None;
                    InsightAction::None
                }
            }
        };

        let command = if outcome.satisfied {
            match outcome.command {
                Some(request) => {
                    self.dedupe_command(store, &request.target_alias, request.value, &mut next)
                        .await?
                }
                None => None,
            }
        } else {
            None
        };

        // State before effects: the recovery contract.
        self.state = store.actor_states.save(&next).await?;

        if let InsightAction::Upsert(insight) = insight_action {
            let saved = store.insights.upsert(&insight).await?;
            store.feed.publish_insight(&saved);
        }
        if let Some(cmd) = command {
            let saved = store.commands.upsert(&cmd).await?;
            store.feed.publish_command(&saved);
            step.command_requested = true;
        }

        Ok(step)
    }

    fn gather_snapshots(
        &self,
        as_of: DateTime<Utc>,
        series: &TimeSeriesStore,
    ) -> HashMap<String, PointSnapshot> {
        let mut snapshots = HashMap::new();
        for (alias, point_id) in &self.instance.bindings {
            if let Some(snapshot) = series.snapshot(point_id, as_of) {
                snapshots.insert(alias.clone(), snapshot);
            }
        }
        snapshots
    }

    /// The open insight for this instance: the state's hint first, the
    /// store query as the authority.
    async fn find_open_insight(&self, store: &Store) -> Result<Option<Insight>, EngineError> {
        if let Some(id) = &self.state.outstanding_insight_id {
            if let Some(insight) = store.insights.get(id).await? {
                if insight.is_open() {
                    return Ok(Some(insight));
                }
            }
        }
        Ok(store.insights.find_open(&self.instance.id).await?)
    }

    /// Build a new command unless one is already outstanding for the
    /// same target point. Re-satisfaction with a different value
    /// refreshes the outstanding command instead of issuing a second
    /// one.
    async fn dedupe_command(
        &self,
        store: &Store,
        target_alias: &str,
        value: f64,
        next: &mut ActorState,
    ) -> Result<Option<Command>, EngineError> {
        let Some(point_id) = self.instance.bindings.get(target_alias) else {
            warn!(
                rule_instance_id = %self.instance.id,
                alias = %target_alias,
                "command target alias has no bound point"
            );
            return Ok(None);
        };

        let outstanding = match self.state.outstanding_commands.get(point_id) {
            Some(existing_id) => store
                .commands
                .get(existing_id)
                .await?
                .filter(|c| c.status == CommandStatus::Requested),
            None => None,
        };
        let outstanding = match outstanding {
            Some(existing) => Some(existing),
            None => {
                store
                    .commands
                    .find_requested(&self.instance.id, point_id)
                    .await?
            }
        };

        if let Some(mut existing) = outstanding {
            next.outstanding_commands
                .insert(point_id.clone(), existing.id.clone());
            if existing.requested_value == value {
                return Ok(None);
            }
            existing.requested_value = value;
            return Ok(Some(existing));
        }

        let cmd = Command::request(
            &self.instance.id,
            &self.instance.entity_id,
            point_id,
            value,
        );
        next.outstanding_commands
            .insert(point_id.clone(), cmd.id.clone());
        Ok(Some(cmd))
    }
}
