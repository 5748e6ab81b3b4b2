//! Execution orchestrator: durable request queue, priority drain and
//! retry accounting.
//!
//! Requests are persisted on enqueue, then drained realtime-first.
//! A dispatch that cannot get pool capacity inside the dispatch
//! timeout (or hits a transient store failure) puts the request back
//! as Pending with its attempt count bumped; past `max_attempts` it is
//! marked Failed and surfaced through the error log.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use faultline_core::config::EngineConfig;
use faultline_core::model::{ExecutionRequest, RequestStatus};
use faultline_storage::{StorageError, Store};

use crate::error::EngineError;
use crate::manager::ActorManager;

pub struct Orchestrator {
    store: Store,
    manager: Arc<ActorManager>,
    config: EngineConfig,
    realtime: Mutex<VecDeque<ExecutionRequest>>,
    batch: Mutex<VecDeque<ExecutionRequest>>,
    wake: Notify,
}

impl Orchestrator {
    pub fn new(store: Store, manager: Arc<ActorManager>, config: EngineConfig) -> Self {
        Self {
            store,
            manager,
            config,
            realtime: Mutex::new(VecDeque::new()),
            batch: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        }
    }

    /// Persist a request and queue it for dispatch. Returns its id.
    pub async fn enqueue(&self, request: ExecutionRequest) -> Result<String, EngineError> {
        let stored = self.store.requests.insert(&request).await?;
        let id = stored.id.clone();
        debug!(request_id = %id, kind = %stored.kind, "request enqueued");
        self.push(stored).await;
        self.wake.notify_one();
        Ok(id)
    }

    async fn push(&self, request: ExecutionRequest) {
        if request.kind.is_realtime() {
            self.realtime.lock().await.push_back(request);
        } else {
            self.batch.lock().await.push_back(request);
        }
    }

    /// Realtime ticks drain before backfills and rule changes.
    async fn next(&self) -> Option<ExecutionRequest> {
        if let Some(request) = self.realtime.lock().await.pop_front() {
            return Some(request);
        }
        self.batch.lock().await.pop_front()
    }

    pub async fn queued(&self) -> usize {
        self.realtime.lock().await.len() + self.batch.lock().await.len()
    }

    /// Pull Pending requests from the durable queue that this worker
    /// does not have in memory: the persisted backlog after a restart,
    /// plus requests enqueued directly by the reconciler. The claim
    /// CAS in [`process`](Self::process) makes double pickup harmless.
    pub async fn restore_pending(&self) -> Result<usize, EngineError> {
        let mut pending = self.store.requests.list_pending().await?;
        pending.sort_by_key(|r| r.requested_at);

        let queued: std::collections::HashSet<String> = {
            let realtime = self.realtime.lock().await;
            let batch = self.batch.lock().await;
            realtime
                .iter()
                .chain(batch.iter())
                .map(|r| r.id.clone())
                .collect()
        };

        let mut restored = 0;
        for request in pending {
            if !queued.contains(&request.id) {
                self.push(request).await;
                restored += 1;
            }
        }
        if restored > 0 {
            debug!(restored, "pending requests picked up from store");
            self.wake.notify_one();
        }
        Ok(restored)
    }

    /// Process queued requests until both queues run dry. Failures are
    /// logged per request and never stop the drain.
    pub async fn drain(&self) {
        while let Some(request) = self.next().await {
            if let Err(e) = self.process(request).await {
                error!(error = %e, "request processing failed");
            }
        }
    }

    /// Drain loop; wakes on enqueue, polls the durable queue on the
    /// engine interval, exits on shutdown.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut poll = tokio::time::interval(self.config.polling_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = poll.tick() => {
                    if let Err(e) = self.restore_pending().await {
                        warn!(error = %e, "failed to poll pending requests");
                    }
                }
                _ = shutdown.notified() => {
                    info!("orchestrator shutting down");
                    return;
                }
            }
            self.drain().await;
        }
    }

    /// Run one request to a terminal or re-queued state.
    pub async fn process(&self, request: ExecutionRequest) -> Result<(), EngineError> {
        let in_progress = match self
            .store
            .requests
            .update_status(
                &request.id,
                request.version,
                RequestStatus::InProgress,
                request.attempts,
            )
            .await
        {
            Ok(updated) => updated,
            Err(StorageError::VersionConflict { .. }) => {
                // Another worker claimed it.
                debug!(request_id = %request.id, "request already claimed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.manager.dispatch(&in_progress).await {
            Ok(summary) => {
                self.store
                    .requests
                    .update_status(
                        &in_progress.id,
                        in_progress.version,
                        RequestStatus::Completed,
                        in_progress.attempts,
                    )
                    .await?;
                self.manager.metrics().record_request_completed();
                info!(
                    request_id = %in_progress.id,
                    kind = %in_progress.kind,
                    actors = summary.actors,
                    evaluated = summary.evaluated,
                    insights_opened = summary.insights_opened,
                    insights_resolved = summary.insights_resolved,
                    commands = summary.commands_requested,
                    "request completed"
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => self.requeue(in_progress, e).await,
            Err(e) => {
                self.fail(in_progress, e.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Put a request back as Pending, or fail it once retries are
    /// exhausted.
    async fn requeue(
        &self,
        request: ExecutionRequest,
        cause: EngineError,
    ) -> Result<(), EngineError> {
        let attempts = request.attempts + 1;
        if attempts > self.config.max_attempts {
            self.fail(
                request,
                format!("retries exhausted after {} attempts: {}", attempts - 1, cause),
            )
            .await?;
            return Ok(());
        }

        warn!(
            request_id = %request.id,
            attempts,
            max_attempts = self.config.max_attempts,
            cause = %cause,
            "request re-queued"
        );
        let pending = self
            .store
            .requests
            .update_status(&request.id, request.version, RequestStatus::Pending, attempts)
            .await?;
        self.push(pending).await;
        self.wake.notify_one();
        Ok(())
    }

    async fn fail(&self, request: ExecutionRequest, reason: String) -> Result<(), EngineError> {
        // Operator-visible: a Failed request means evaluations were
        // skipped and may need a manual backfill.
        error!(
            request_id = %request.id,
            kind = %request.kind,
            reason = %reason,
            "execution request failed permanently"
        );
        self.store
            .requests
            .update_status(
                &request.id,
                request.version,
                RequestStatus::Failed { reason },
                request.attempts,
            )
            .await?;
        self.manager.metrics().record_request_failed();
        Ok(())
    }
}
