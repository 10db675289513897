/*!
 * Notifications a session publishes.
 */
use chrono::{DateTime, Utc};

use skylink_core::event::Event;
use skylink_core::types::Id;
use skylink_devices::property::PropertyChange;

use crate::operation::Operation;
use crate::session::SessionState;

/// What changed
#[derive(Debug, Clone)]
pub enum SessionEventKind {
    /// The state machine moved
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// A property was confirmed with a new value or went stale
    PropertyChanged(PropertyChange),
    /// An operation changed status
    OperationUpdated(Operation),
}

/// One session notification
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Session that produced it
    pub session: Id,
    /// Configured device name
    pub device: String,
    /// When it was produced
    pub timestamp: DateTime<Utc>,
    /// Payload
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub(crate) fn new(session: &Id, device: &str, kind: SessionEventKind) -> Self {
        Self {
            session: session.clone(),
            device: device.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

impl Event for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            SessionEventKind::StateChanged { .. } => "session.state_changed",
            SessionEventKind::PropertyChanged(_) => "session.property_changed",
            SessionEventKind::OperationUpdated(_) => "session.operation_updated",
        }
    }

    fn source(&self) -> Option<&Id> {
        Some(&self.session)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
