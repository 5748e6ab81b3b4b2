//! End-to-end scenarios over the full pipeline: filesystem rule
//! repository → reconciler → instantiator → orchestrator → actors,
//! with the in-memory store and a static topology.

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use faultline_core::model::{
    ExecutionRequest, InsightState, InstanceStatus, RequestStatus, TimeSeriesSample,
};
use faultline_core::Config;
use faultline_engine::{ActorManager, Orchestrator};
use faultline_rules::{
    EvaluatorProvider, FsRuleRepository, Reconciler, Relationship, RuleInstantiator,
    StaticTopology,
};
use faultline_storage::{ChangeEvent, Store};
use faultline_timeseries::TimeSeriesStore;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn rule_yaml(version: u32, limit: f64) -> String {
    format!(
        r#"
metadata:
  id: ahu-supply-temp-high
  version: {version}
  name: Supply air temperature too high
applicability: "model:ahu"
evaluator:
  ref: threshold
  params:
    point: temp
    operator: gt
    limit: {limit}
points:
  - alias: temp
    capability: supply-temp
"#
    )
}

const INSTANCE: &str = "ahu-supply-temp-high_e1";

struct Harness {
    _rules_dir: TempDir,
    rules_path: std::path::PathBuf,
    store: Store,
    series: Arc<TimeSeriesStore>,
    provider: Arc<EvaluatorProvider>,
    config: Config,
    reconciler: Reconciler,
    manager: Arc<ActorManager>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        let config = Config::for_tests();
        let rules_dir = TempDir::new().unwrap();
        fs::write(rules_dir.path().join("r1.yml"), rule_yaml(1, 80.0)).unwrap();

        let topology = Arc::new(StaticTopology::new());
        topology.add_entity(
            "e1",
            "ahu",
            vec![Relationship {
                capability: "supply-temp".to_string(),
                point_id: "p1".to_string(),
            }],
        );

        let (store, _) = Store::in_memory();
        let series = Arc::new(TimeSeriesStore::new(&config.buffer));
        let provider = Arc::new(EvaluatorProvider::with_builtins());

        let repo = Arc::new(FsRuleRepository::new(rules_dir.path().to_path_buf()));
        let instantiator = Arc::new(RuleInstantiator::new(topology, store.instances.clone()));
        let reconciler = Reconciler::new(
            repo,
            store.clone(),
            instantiator,
            provider.clone(),
            config.reconciler.clone(),
        );

        let (manager, orchestrator) = build_orchestrator(&store, &series, &provider, &config);

        Self {
            rules_path: rules_dir.path().to_path_buf(),
            _rules_dir: rules_dir,
            store,
            series,
            provider,
            config,
            reconciler,
            manager,
            orchestrator,
        }
    }

    /// One reconciliation pass, then run the requests it enqueued to
    /// completion so every test starts from a settled queue.
    async fn reconcile(&self) -> faultline_rules::ReconcileReport {
        let report = self.reconciler.run_once().await.unwrap();
        self.orchestrator.restore_pending().await.unwrap();
        self.orchestrator.drain().await;
        report
    }

    /// Ingest one sample and run a realtime tick to completion.
    async fn sample_and_tick(&self, at: DateTime<Utc>, value: f64) {
        self.series
            .ingest(&TimeSeriesSample::new("p1", at, value))
            .unwrap();
        self.tick().await;
    }

    async fn tick(&self) {
        let id = self
            .orchestrator
            .enqueue(ExecutionRequest::realtime_tick())
            .await
            .unwrap();
        self.orchestrator.drain().await;
        let stored = self.store.requests.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
    }

    async fn open_insight(&self) -> Option<faultline_core::model::Insight> {
        self.store.insights.find_open(INSTANCE).await.unwrap()
    }

    /// Simulate a worker crash: rebuild the manager and orchestrator
    /// over the same store and buffers, losing every resident actor.
    fn restart(&mut self) {
        let (manager, orchestrator) =
            build_orchestrator(&self.store, &self.series, &self.provider, &self.config);
        self.manager = manager;
        self.orchestrator = orchestrator;
    }
}

fn build_orchestrator(
    store: &Store,
    series: &Arc<TimeSeriesStore>,
    provider: &Arc<EvaluatorProvider>,
    config: &Config,
) -> (Arc<ActorManager>, Orchestrator) {
    let manager = Arc::new(ActorManager::new(
        store.clone(),
        series.clone(),
        provider.clone(),
        config.engine.clone(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), manager.clone(), config.engine.clone());
    (manager, orchestrator)
}

#[tokio::test]
async fn test_threshold_lifecycle_end_to_end() {
    let h = Harness::new();
    let report = h.reconcile().await;
    assert_eq!(report.applied.len(), 1);
    assert!(report.conflicts.is_empty());

    let mut feed = h.store.feed.subscribe();

    // Below the limit: no insight.
    h.sample_and_tick(ts(60), 70.0).await;
    assert!(h.open_insight().await.is_none());

    // First violation opens a New insight at the trigger time.
    h.sample_and_tick(ts(120), 90.0).await;
    let open = h.open_insight().await.unwrap();
    assert_eq!(open.state, InsightState::New);
    assert_eq!(open.first_occurred, ts(120));

    // Still violating: same insight confirmed, not duplicated.
    h.sample_and_tick(ts(180), 95.0).await;
    let open = h.open_insight().await.unwrap();
    assert_eq!(open.state, InsightState::Active);
    assert_eq!(open.first_occurred, ts(120));
    assert_eq!(open.last_occurred, ts(180));
    assert_eq!(open.trigger_count, 2);

    // Back under the limit: resolved.
    h.sample_and_tick(ts(240), 60.0).await;
    assert!(h.open_insight().await.is_none());

    let all = h.store.insights.list_by_instance(INSTANCE).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, InsightState::Resolved);

    // The change feed saw every transition in order.
    let mut states = Vec::new();
    while let Ok(event) = feed.try_recv() {
        if let ChangeEvent::InsightUpserted(insight) = event {
            states.push(insight.state);
        }
    }
    assert_eq!(
        states,
        vec![InsightState::New, InsightState::Active, InsightState::Resolved]
    );
}

#[tokio::test]
async fn test_recovery_continues_from_persisted_state() {
    let mut h = Harness::new();
    h.reconcile().await;

    h.sample_and_tick(ts(60), 90.0).await;
    h.sample_and_tick(ts(120), 95.0).await;
    let before = h.open_insight().await.unwrap();
    assert_eq!(before.trigger_count, 2);

    // Crash and rebuild: actors rehydrate from persisted state.
    h.restart();

    h.sample_and_tick(ts(180), 96.0).await;
    let after = h.open_insight().await.unwrap();
    // Same insight, continued, not reopened.
    assert_eq!(after.id, before.id);
    assert_eq!(after.first_occurred, ts(60));
    assert_eq!(after.trigger_count, 3);
    assert_eq!(
        h.store
            .insights
            .list_by_instance(INSTANCE)
            .await
            .unwrap()
            .len(),
        1
    );

    let state = h.store.actor_states.load(INSTANCE).await.unwrap().unwrap();
    assert!(state.satisfied);
    assert_eq!(state.last_evaluated, Some(ts(180)));
}

#[tokio::test]
async fn test_replay_after_restart_is_idempotent() {
    let mut h = Harness::new();
    h.reconcile().await;
    h.sample_and_tick(ts(60), 90.0).await;

    // Restart and replay a tick over data at or before the last
    // evaluated timestamp: nothing moves.
    h.restart();
    h.series
        .ingest(&TimeSeriesSample::new("p1", ts(60), 90.0))
        .unwrap();
    h.tick().await;

    let open = h.open_insight().await.unwrap();
    assert_eq!(open.trigger_count, 1);
    assert_eq!(open.state, InsightState::New);
}

#[tokio::test]
async fn test_rule_update_is_applied_safely() {
    let h = Harness::new();
    h.reconcile().await;
    h.sample_and_tick(ts(60), 95.0).await;
    assert!(h.open_insight().await.is_some());

    // Raise the limit above the current reading and bump the version.
    fs::write(h.rules_path.join("r1.yml"), rule_yaml(2, 200.0)).unwrap();
    let report = h.reconcile().await;
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.requests_enqueued, 1);

    // The RuleChanged request reset the actor and re-evaluated against
    // the new limit: 95 no longer violates, so the insight resolved.
    assert!(h.open_insight().await.is_none());

    // The instance was superseded in place at the new version.
    let instance = h.store.instances.get(INSTANCE).await.unwrap().unwrap();
    assert_eq!(instance.rule_template_version, 2);
}

#[tokio::test]
async fn test_invalid_rule_file_never_evaluates() {
    let h = Harness::new();
    // Second template referencing an unknown evaluator.
    fs::write(
        h.rules_path.join("bad.yml"),
        r#"
metadata:
  id: broken-rule
  version: 1
  name: Broken
applicability: "model:ahu"
evaluator:
  ref: does-not-exist
  params: {}
points: []
"#,
    )
    .unwrap();

    let report = h.reconcile().await;
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.conflicts.len(), 1);

    h.sample_and_tick(ts(60), 95.0).await;
    // Only the valid rule produced anything.
    assert!(h.open_insight().await.is_some());
    assert!(h.store.templates.get("broken-rule").await.unwrap().is_none());
    assert!(h.store.instances.get("broken-rule_e1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_instance_skips_and_resumes() {
    let h = Harness::new();
    h.reconcile().await;

    h.sample_and_tick(ts(60), 90.0).await;
    let opened = h.open_insight().await.unwrap();
    assert_eq!(h.manager.resident_count().await, 1);

    // Pause the instance.
    let mut instance = h.store.instances.get(INSTANCE).await.unwrap().unwrap();
    instance.status = InstanceStatus::Disabled;
    h.store.instances.update(&instance).await.unwrap();

    // A violating sample while paused is never evaluated.
    h.sample_and_tick(ts(120), 99.0).await;
    let state = h.store.actor_states.load(INSTANCE).await.unwrap().unwrap();
    assert_eq!(state.last_evaluated, Some(ts(60)));
    assert_eq!(state.trigger_count, 1);

    // Past the grace period the actor is evicted with state intact.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    h.tick().await;
    assert_eq!(h.manager.resident_count().await, 0);
    assert!(h.store.actor_states.load(INSTANCE).await.unwrap().is_some());

    // Resume: evaluation continues from the kept state.
    let mut instance = h.store.instances.get(INSTANCE).await.unwrap().unwrap();
    instance.status = InstanceStatus::Active;
    h.store.instances.update(&instance).await.unwrap();
    h.sample_and_tick(ts(180), 99.0).await;

    let open = h.open_insight().await.unwrap();
    assert_eq!(open.id, opened.id);
    assert_eq!(open.trigger_count, 2);
    assert_eq!(open.last_occurred, ts(180));
}

#[tokio::test]
async fn test_late_sample_cannot_flip_state() {
    let h = Harness::new();
    h.reconcile().await;

    // Healthy reading well past the lateness window.
    h.sample_and_tick(ts(10_000), 60.0).await;
    assert!(h.open_insight().await.is_none());

    // A violating sample far in the past is dropped at ingest and can
    // never be observed by an evaluation.
    let err = h
        .series
        .ingest(&TimeSeriesSample::new("p1", ts(0), 99.0))
        .unwrap_err();
    assert!(matches!(
        err,
        faultline_timeseries::BufferError::LateSampleDropped { .. }
    ));

    h.tick().await;
    assert!(h.open_insight().await.is_none());
    assert_eq!(h.series.metrics().snapshot().late_dropped, 1);
}
