//! Insight/command change feed.
//!
//! Newly created or updated insights and commands are published here
//! for external consumers (indexing, notification, remediation
//! dispatch). In-process broadcast; the cross-process transport is an
//! external collaborator.

use tokio::sync::broadcast;
use tracing::trace;

use faultline_core::model::{Command, Insight};

#[derive(Debug, Clone)]
pub enum ChangeEvent {
    InsightUpserted(Insight),
    CommandUpserted(Command),
}

/// Bounded broadcast channel; slow subscribers lag and skip, they
/// never block the engine.
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish_insight(&self, insight: &Insight) {
        trace!(insight_id = %insight.id, state = %insight.state, "publishing insight change");
        let _ = self.tx.send(ChangeEvent::InsightUpserted(insight.clone()));
    }

    pub fn publish_command(&self, command: &Command) {
        trace!(command_id = %command.id, status = %command.status, "publishing command change");
        let _ = self.tx.send(ChangeEvent::CommandUpserted(command.clone()));
    }
}
