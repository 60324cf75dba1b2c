//! Orchestrator event stream.
//!
//! Supervisors publish lifecycle events onto a broadcast channel; any UI
//! (or the verbose CLI mode) subscribes without touching the core. Lagging
//! subscribers lose old events rather than slowing anything down.

use crate::providers::InstanceId;
use crate::registry::{AssignmentStatus, SyncReport};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    SupervisorStarted {
        assignment_id: Uuid,
        issue_number: u64,
        instance_id: InstanceId,
    },
    StatusChanged {
        assignment_id: Uuid,
        issue_number: u64,
        status: AssignmentStatus,
        reason: Option<String>,
    },
    AssignmentFinished {
        assignment_id: Uuid,
        issue_number: u64,
        status: AssignmentStatus,
        pr_number: Option<u64>,
    },
    ReconcileCompleted {
        report: SyncReport,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(OrchestratorEvent::ReconcileCompleted {
            report: SyncReport::default(),
        });
        match rx.recv().await.unwrap() {
            OrchestratorEvent::ReconcileCompleted { report } => {
                assert_eq!(report, SyncReport::default());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(OrchestratorEvent::StatusChanged {
            assignment_id: Uuid::new_v4(),
            issue_number: 1,
            status: AssignmentStatus::InProgress,
            reason: None,
        });
    }
}
