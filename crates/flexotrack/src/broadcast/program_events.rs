//! Program change broadcaster for real-time client updates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::program::{MachineProgram, ProgramId, ProgramStatus};

/// Kind of change being announced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgramEventKind {
    Created,
    Updated,
    StatusChanged,
}

/// Lightweight payload pushed to subscribers after a committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramEvent {
    pub kind: ProgramEventKind,
    pub program_id: ProgramId,
    pub machine_number: u32,
    pub status: ProgramStatus,
    pub work_order: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgramEvent {
    fn from_program(kind: ProgramEventKind, program: &MachineProgram) -> Self {
        Self {
            kind,
            program_id: program.id,
            machine_number: program.machine_number,
            status: program.status,
            work_order: program.work_order.clone(),
            progress: program.progress,
            notes: program.notes.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a creation event.
    pub fn created(program: &MachineProgram) -> Self {
        Self::from_program(ProgramEventKind::Created, program)
    }

    /// Creates an update event.
    pub fn updated(program: &MachineProgram) -> Self {
        Self::from_program(ProgramEventKind::Updated, program)
    }

    /// Creates a status-change event carrying the notes given with the change.
    pub fn status_changed(program: &MachineProgram, notes: Option<&str>) -> Self {
        let mut event = Self::from_program(ProgramEventKind::StatusChanged, program);
        event.notes = notes.map(str::to_string);
        event
    }
}

/// Errors a notification transport may report.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification transport failure: {0}")]
    TransportFailure(String),
}

/// Outbound port the engine calls after every committed mutation.
///
/// Delivery is best effort: implementations must not block on subscribers.
pub trait ChangeNotifier: Send + Sync {
    /// Publishes an event; returns how many subscribers it reached.
    fn publish(&self, event: ProgramEvent) -> Result<usize, NotifyError>;
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Clone)]
pub struct ProgramEventBroadcaster {
    sender: Arc<broadcast::Sender<ProgramEvent>>,
}

impl ProgramEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Creates a new subscriber. It only sees events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgramEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ChangeNotifier for ProgramEventBroadcaster {
    fn publish(&self, event: ProgramEvent) -> Result<usize, NotifyError> {
        // No active receivers is fine
        Ok(self.sender.send(event).unwrap_or(0))
    }
}

impl Default for ProgramEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::model::tests_support::program;

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = ProgramEventBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let reached = broadcaster
            .publish(ProgramEvent::created(&program(4, "OT-4", 11)))
            .unwrap();
        assert_eq!(reached, 1);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, ProgramEventKind::Created);
        assert_eq!(received.program_id, 4);
        assert_eq!(received.machine_number, 11);
        assert_eq!(received.work_order, "OT-4");
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let broadcaster = ProgramEventBroadcaster::default();
        let reached = broadcaster
            .publish(ProgramEvent::updated(&program(1, "OT-1", 2)))
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let broadcaster = ProgramEventBroadcaster::new(10);
        broadcaster
            .publish(ProgramEvent::created(&program(1, "OT-1", 2)))
            .unwrap();

        let mut rx = broadcaster.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_status_changed_carries_notes() {
        let mut p = program(2, "OT-2", 3);
        p.status = ProgramStatus::Suspended;
        let event = ProgramEvent::status_changed(&p, Some("plate change"));
        assert_eq!(event.kind, ProgramEventKind::StatusChanged);
        assert_eq!(event.status, ProgramStatus::Suspended);
        assert_eq!(event.notes.as_deref(), Some("plate change"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "status_changed");
        assert_eq!(json["programId"], 2);
    }
}
