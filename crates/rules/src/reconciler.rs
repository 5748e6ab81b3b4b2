//! Git-sync reconciler: diffs the rule repository head against the
//! stored templates and drives the instantiator.
//!
//! One pass is a pure diff-and-apply: added and updated templates are
//! validated, expanded and upserted; templates that vanished from the
//! repository are retired. Templates that fail validation become
//! conflicts and are never applied — the previously stored version (if
//! any) keeps running untouched.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use faultline_core::config::ReconcilerConfig;
use faultline_core::model::{ExecutionRequest, RequestKind, RequestScope, RuleTemplate};
use faultline_storage::Store;

use crate::error::RulesError;
use crate::evaluator::EvaluatorProvider;
use crate::instantiator::RuleInstantiator;
use crate::repository::RuleRepository;
use crate::validation::validate_template;

/// One applied template delta.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TemplateChange {
    Added { template_id: String, version: u32 },
    Updated { template_id: String, version: u32 },
    Removed { template_id: String },
}

/// A template (or file) the pass refused to apply.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    /// Absent when the source file could not even be parsed.
    pub template_id: Option<String>,
    pub reason: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub revision: u64,
    pub applied: Vec<TemplateChange>,
    pub conflicts: Vec<Conflict>,
    pub requests_enqueued: usize,
    /// Set when the divergence guard refused the whole pass.
    pub diverged: bool,
}

pub struct Reconciler {
    repo: Arc<dyn RuleRepository>,
    store: Store,
    instantiator: Arc<RuleInstantiator>,
    provider: Arc<EvaluatorProvider>,
    config: ReconcilerConfig,
    wake: Notify,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn RuleRepository>,
        store: Store,
        instantiator: Arc<RuleInstantiator>,
        provider: Arc<EvaluatorProvider>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            repo,
            store,
            instantiator,
            provider,
            config,
            wake: Notify::new(),
        }
    }

    /// Request an on-demand pass from the run loop.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Periodic loop: a pass per interval, plus on-demand passes via
    /// [`trigger`](Self::trigger), until shutdown is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.notified() => {
                    info!("reconciler shutting down");
                    return;
                }
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, "reconciliation pass failed");
            }
        }
    }

    /// One reconciliation pass.
    pub async fn run_once(&self) -> Result<ReconcileReport, RulesError> {
        let head = self.repo.head_revision().await?;
        let last_applied = self.store.templates.last_applied_revision().await?;

        let mut report = ReconcileReport {
            revision: head,
            ..Default::default()
        };

        // Divergence guard: a head too far beyond what we last applied
        // means the local checkout and the store no longer describe the
        // same history. Refuse the whole pass and alert.
        if let Some(last) = last_applied {
            if head > last && head - last > self.config.max_revision_lag {
                error!(
                    head,
                    last_applied = last,
                    max_lag = self.config.max_revision_lag,
                    "revision divergence detected, refusing reconciliation pass"
                );
                report.diverged = true;
                report.conflicts.push(Conflict {
                    template_id: None,
                    reason: format!(
                        "repository head {} is {} revisions past last applied {}, exceeding lag limit {}",
                        head,
                        head - last,
                        last,
                        self.config.max_revision_lag
                    ),
                });
                return Ok(report);
            }
            if head == last {
                return Ok(report);
            }
        }

        let listing = self.repo.list_templates().await?;
        for failure in &listing.failures {
            report.conflicts.push(Conflict {
                template_id: None,
                reason: format!("{}: {}", failure.path.display(), failure.error),
            });
        }

        let stored = self.store.templates.list().await?;
        let mut apply_failed = false;

        for incoming in &listing.templates {
            let existing = stored.iter().find(|t| t.id == incoming.id);
            if existing == Some(incoming) {
                continue;
            }
            if let Some(current) = existing {
                if current.version > incoming.version {
                    report.conflicts.push(Conflict {
                        template_id: Some(incoming.id.clone()),
                        reason: format!(
                            "version {} is older than stored version {}",
                            incoming.version, current.version
                        ),
                    });
                    continue;
                }
            }

            let validation = validate_template(incoming, &self.provider);
            for w in &validation.warnings {
                warn!(template_id = %incoming.id, field = %w.field, message = %w.message,
                    "template validation warning");
            }
            if !validation.is_valid() {
                warn!(template_id = %incoming.id, errors = %validation.summary(),
                    "template rejected by validation");
                report.conflicts.push(Conflict {
                    template_id: Some(incoming.id.clone()),
                    reason: validation.summary(),
                });
                continue;
            }

            match self.apply_template(incoming).await {
                Ok(enqueued) => {
                    report.requests_enqueued += enqueued;
                    report.applied.push(match existing {
                        Some(_) => TemplateChange::Updated {
                            template_id: incoming.id.clone(),
                            version: incoming.version,
                        },
                        None => TemplateChange::Added {
                            template_id: incoming.id.clone(),
                            version: incoming.version,
                        },
                    });
                }
                Err(e) => {
                    apply_failed = true;
                    error!(template_id = %incoming.id, error = %e, "failed to apply template");
                    report.conflicts.push(Conflict {
                        template_id: Some(incoming.id.clone()),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Removals: only safe when every file at head was readable,
        // otherwise a broken file would retire the rules it defines.
        if listing.failures.is_empty() {
            for current in &stored {
                if listing.templates.iter().any(|t| t.id == current.id) {
                    continue;
                }
                match self.remove_template(current).await {
                    Ok(()) => report.applied.push(TemplateChange::Removed {
                        template_id: current.id.clone(),
                    }),
                    Err(e) => {
                        apply_failed = true;
                        error!(template_id = %current.id, error = %e, "failed to remove template");
                        report.conflicts.push(Conflict {
                            template_id: Some(current.id.clone()),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        } else {
            warn!(
                failures = listing.failures.len(),
                "skipping template removals while load failures are present"
            );
        }

        // A store or expansion failure leaves the pass incomplete; keep
        // the old marker so the next pass retries the same head.
        if !apply_failed {
            self.store.templates.set_last_applied_revision(head).await?;
        }

        info!(
            revision = head,
            applied = report.applied.len(),
            conflicts = report.conflicts.len(),
            requests = report.requests_enqueued,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Expand, persist and schedule re-evaluation for one template.
    /// Returns the number of execution requests enqueued.
    async fn apply_template(&self, template: &RuleTemplate) -> Result<usize, RulesError> {
        let expansion = self.instantiator.expand(template).await?;
        self.store.templates.upsert(template).await?;

        let entities: Vec<String> = expansion
            .created
            .iter()
            .map(|i| i.entity_id.clone())
            .collect();
        if entities.is_empty() {
            return Ok(0);
        }
        let request = ExecutionRequest::new(
            RequestKind::RuleChanged {
                rule_template_id: template.id.clone(),
            },
            RequestScope::Entities(entities),
            "reconciler",
        );
        self.store.requests.insert(&request).await?;
        Ok(1)
    }

    async fn remove_template(&self, template: &RuleTemplate) -> Result<(), RulesError> {
        self.instantiator.retire_template(&template.id).await?;
        self.store.templates.delete(&template.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use faultline_core::model::{InstanceStatus, PointBinding};
    use faultline_storage::RuleInstanceRepository;

    use crate::repository::{LoadFailure, TemplateListing};
    use crate::topology::{Relationship, StaticTopology};

    struct StubRepo {
        head: Mutex<u64>,
        listing: Mutex<TemplateListing>,
    }

    impl StubRepo {
        fn new() -> Self {
            Self {
                head: Mutex::new(1),
                listing: Mutex::new(TemplateListing::default()),
            }
        }

        fn set(&self, head: u64, templates: Vec<RuleTemplate>) {
            *self.head.lock().unwrap() = head;
            self.listing.lock().unwrap().templates = templates;
        }

        fn add_failure(&self, path: &str, error: &str) {
            self.listing.lock().unwrap().failures.push(LoadFailure {
                path: PathBuf::from(path),
                error: error.to_string(),
            });
        }
    }

    #[async_trait]
    impl RuleRepository for StubRepo {
        async fn head_revision(&self) -> Result<u64, RulesError> {
            Ok(*self.head.lock().unwrap())
        }

        async fn list_templates(&self) -> Result<TemplateListing, RulesError> {
            Ok(self.listing.lock().unwrap().clone())
        }
    }

    fn template(id: &str, version: u32) -> RuleTemplate {
        RuleTemplate {
            id: id.to_string(),
            version,
            name: format!("Rule {}", id),
            enabled: true,
            expression_ref: "threshold".to_string(),
            params: serde_json::json!({"point": "temp", "operator": "gt", "limit": 80.0}),
            applicability: "model:ahu".to_string(),
            points: vec![PointBinding {
                alias: "temp".to_string(),
                capability: "supply-temp".to_string(),
            }],
        }
    }

    fn harness() -> (Arc<StubRepo>, Reconciler, Store) {
        let repo = Arc::new(StubRepo::new());
        let topo = Arc::new(StaticTopology::new());
        topo.add_entity(
            "e1",
            "ahu",
            vec![Relationship {
                capability: "supply-temp".to_string(),
                point_id: "p1".to_string(),
            }],
        );
        let (store, _) = Store::in_memory();
        let instantiator = Arc::new(RuleInstantiator::new(
            topo,
            store.instances.clone(),
        ));
        let config = ReconcilerConfig {
            interval: Duration::from_millis(50),
            max_revision_lag: 10,
            rules_dir: PathBuf::from("unused"),
        };
        let reconciler = Reconciler::new(
            repo.clone(),
            store.clone(),
            instantiator,
            Arc::new(EvaluatorProvider::with_builtins()),
            config,
        );
        (repo, reconciler, store)
    }

    #[tokio::test]
    async fn test_added_template_is_applied_and_expanded() {
        let (repo, reconciler, store) = harness();
        repo.set(1, vec![template("r1", 1)]);

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(
            report.applied,
            vec![TemplateChange::Added {
                template_id: "r1".to_string(),
                version: 1
            }]
        );
        assert_eq!(report.requests_enqueued, 1);
        assert!(report.conflicts.is_empty());

        assert!(store.templates.get("r1").await.unwrap().is_some());
        assert_eq!(store.instances.list_evaluatable().await.unwrap().len(), 1);
        assert_eq!(store.templates.last_applied_revision().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_unchanged_head_is_a_noop() {
        let (repo, reconciler, _store) = harness();
        repo.set(1, vec![template("r1", 1)]);
        reconciler.run_once().await.unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert!(report.applied.is_empty());
        assert!(report.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_template_becomes_conflict_never_applied() {
        let (repo, reconciler, store) = harness();
        let mut broken = template("bad", 1);
        broken.expression_ref = "no-such-evaluator".to_string();
        repo.set(1, vec![template("r1", 1), broken]);

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].template_id.as_deref(), Some("bad"));

        assert!(store.templates.get("bad").await.unwrap().is_none());
        let instances = store.instances.list_evaluatable().await.unwrap();
        assert!(instances.iter().all(|i| i.rule_template_id == "r1"));
    }

    #[tokio::test]
    async fn test_update_supersedes_instances() {
        let (repo, reconciler, store) = harness();
        repo.set(1, vec![template("r1", 1)]);
        reconciler.run_once().await.unwrap();

        repo.set(2, vec![template("r1", 2)]);
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(
            report.applied,
            vec![TemplateChange::Updated {
                template_id: "r1".to_string(),
                version: 2
            }]
        );

        let instances = store.instances.list_evaluatable().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].rule_template_version, 2);
        assert_eq!(instances[0].status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn test_removed_template_retires_instances() {
        let (repo, reconciler, store) = harness();
        repo.set(1, vec![template("r1", 1)]);
        reconciler.run_once().await.unwrap();

        repo.set(2, vec![]);
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(
            report.applied,
            vec![TemplateChange::Removed {
                template_id: "r1".to_string()
            }]
        );
        assert!(store.templates.get("r1").await.unwrap().is_none());
        assert!(store.instances.list_evaluatable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removals_skipped_while_load_failures_present() {
        let (repo, reconciler, store) = harness();
        repo.set(1, vec![template("r1", 1)]);
        reconciler.run_once().await.unwrap();

        repo.set(2, vec![]);
        repo.add_failure("r1.yml", "mapping values are not allowed here");
        let report = reconciler.run_once().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        // Template stays until the checkout is readable again.
        assert!(store.templates.get("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_divergence_guard_refuses_whole_pass() {
        let (repo, reconciler, store) = harness();
        repo.set(1, vec![template("r1", 1)]);
        reconciler.run_once().await.unwrap();

        repo.set(500, vec![template("r1", 2), template("r2", 1)]);
        let report = reconciler.run_once().await.unwrap();
        assert!(report.diverged);
        assert!(report.applied.is_empty());

        // Nothing moved: old template version, old revision marker.
        assert_eq!(store.templates.get("r1").await.unwrap().unwrap().version, 1);
        assert!(store.templates.get("r2").await.unwrap().is_none());
        assert_eq!(store.templates.last_applied_revision().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict() {
        let (repo, reconciler, store) = harness();
        repo.set(1, vec![template("r1", 3)]);
        reconciler.run_once().await.unwrap();

        repo.set(2, vec![template("r1", 2)]);
        let report = reconciler.run_once().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(store.templates.get("r1").await.unwrap().unwrap().version, 3);
    }
}
