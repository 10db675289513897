/*!
 * Long-running physical operations.
 *
 * An [`Operation`] is created when the dispatcher's start command is
 * acknowledged and is driven to a terminal status by the poller. Callers
 * follow it through an [`OperationHandle`], which observes every status
 * change the session publishes.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use skylink_core::types::{Id, Value};
use skylink_devices::device::Intent;

use crate::error::ErrorKind;

/// Number of finished operations a session remembers
pub const HISTORY_LIMIT: usize = 32;

/// Lifecycle of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Accepted, start command not yet acknowledged
    Pending,
    /// Acknowledged by the device and being tracked
    InProgress,
    /// The device reported the target reached
    Completed,
    /// Stopped on request
    Aborted,
    /// Ended without reaching the target
    Failed(ErrorKind),
}

impl OperationStatus {
    /// Whether no further progress will be tracked
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Aborted | OperationStatus::Failed(_)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::InProgress => write!(f, "in progress"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Aborted => write!(f, "aborted"),
            OperationStatus::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// The failure recorded on an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Failure class
    pub kind: ErrorKind,
    /// What happened
    pub message: String,
}

/// One tracked physical action
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Operation ID
    pub id: Id,
    /// The intent that started it
    pub intent: Intent,
    /// Value the driver judges completion against
    pub target: Value,
    /// Wall-clock start time
    pub started_at: DateTime<Utc>,
    /// Time after which a stalled operation fails
    pub deadline: Instant,
    /// Current status
    pub status: OperationStatus,
    /// Failure detail once failed
    pub last_error: Option<OperationError>,
}

impl Operation {
    /// Create a pending operation
    pub fn new(intent: Intent, deadline: Instant) -> Self {
        Self {
            id: Id::new(),
            target: intent.requested_value().unwrap_or(Value::Bool(true)),
            intent,
            started_at: Utc::now(),
            deadline,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }

    /// Short kind name (`move_absolute`, `slew`, ...)
    pub fn kind(&self) -> &'static str {
        self.intent.name()
    }
}

/// Session-side record of an operation with the channel its handles watch
#[derive(Debug)]
pub(crate) struct Tracked {
    pub(crate) op: Operation,
    tx: watch::Sender<Operation>,
    closest: Option<f64>,
    pub(crate) halting_since: Option<Instant>,
}

impl Tracked {
    pub(crate) fn new(op: Operation) -> (Self, OperationHandle) {
        let (tx, rx) = watch::channel(op.clone());
        let handle = OperationHandle {
            id: op.id.clone(),
            kind: op.kind(),
            rx,
        };
        let tracked = Self {
            op,
            tx,
            closest: None,
            halting_since: None,
        };
        (tracked, handle)
    }

    /// Record the distance left to the target, returning whether it is
    /// closer than any earlier poll
    pub(crate) fn note_progress(&mut self, remaining: f64) -> bool {
        let closer = match self.closest {
            None => true,
            Some(best) => remaining < best,
        };
        if closer {
            self.closest = Some(remaining);
        }
        closer
    }

    pub(crate) fn set_status(&mut self, status: OperationStatus) {
        self.op.status = status;
        self.tx.send_replace(self.op.clone());
    }

    pub(crate) fn fail(&mut self, kind: ErrorKind, message: String) {
        self.op.last_error = Some(OperationError { kind, message });
        self.set_status(OperationStatus::Failed(kind));
    }
}

/// Caller-side view of an operation
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: Id,
    kind: &'static str,
    rx: watch::Receiver<Operation>,
}

impl OperationHandle {
    /// Operation ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Operation kind
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Current status
    pub fn status(&self) -> OperationStatus {
        self.rx.borrow().status
    }

    /// Latest copy of the operation
    pub fn snapshot(&self) -> Operation {
        self.rx.borrow().clone()
    }

    /// Wait until the operation reaches a terminal status.
    ///
    /// Returns the last known state if the session is dropped first.
    pub async fn wait(&self) -> Operation {
        let mut rx = self.rx.clone();
        let finished = rx
            .wait_for(|op| op.status.is_terminal())
            .await
            .map(|op| op.clone());
        finished.unwrap_or_else(|_| rx.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracked() -> (Tracked, OperationHandle) {
        let op = Operation::new(Intent::MoveAbsolute(2000), Instant::now() + Duration::from_secs(5));
        Tracked::new(op)
    }

    #[test]
    fn test_new_operation() {
        let (tracked, handle) = tracked();
        assert_eq!(tracked.op.target, Value::Int(2000));
        assert_eq!(handle.kind(), "move_absolute");
        assert_eq!(handle.status(), OperationStatus::Pending);
        assert!(!handle.status().is_terminal());
    }

    #[test]
    fn test_progress_needs_a_shrinking_distance() {
        let (mut tracked, _) = tracked();
        assert!(tracked.note_progress(900.0));
        assert!(!tracked.note_progress(900.0));
        assert!(tracked.note_progress(800.0));
        // Moving away or swinging back to an earlier distance is not progress
        assert!(!tracked.note_progress(850.0));
        assert!(!tracked.note_progress(800.0));

        let (mut unknown, _) = Tracked::new(Operation::new(Intent::Park, Instant::now()));
        assert!(unknown.note_progress(f64::INFINITY));
        assert!(!unknown.note_progress(f64::INFINITY));
    }

    #[tokio::test]
    async fn test_wait_sees_terminal_status() {
        let (mut tracked, handle) = tracked();
        tracked.set_status(OperationStatus::InProgress);
        assert_eq!(handle.status(), OperationStatus::InProgress);

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        tracked.fail(ErrorKind::Timeout, "stalled at 1500".to_string());

        let op = waiter.await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed(ErrorKind::Timeout));
        assert_eq!(op.last_error.unwrap().message, "stalled at 1500");
    }

    #[tokio::test]
    async fn test_wait_after_session_dropped() {
        let (tracked, handle) = tracked();
        drop(tracked);
        assert_eq!(handle.wait().await.status, OperationStatus::Pending);
    }
}
