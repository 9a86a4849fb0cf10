//! Session state and event types

use crate::transport::TransportState;
use livepipe_core::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a session worker
///
/// `Created → Negotiating → Live → Closed`; `Closed` is reachable from every
/// state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Built but no offer processed yet
    Created,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Answer produced; media may flow
    Live,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Created, SessionState::Negotiating)
                | (SessionState::Negotiating, SessionState::Live)
                | (SessionState::Created, SessionState::Closed)
                | (SessionState::Negotiating, SessionState::Closed)
                | (SessionState::Live, SessionState::Closed)
        )
    }

    /// Whether the state is terminal
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Live => "live",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the pipeline a track sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackRole {
    /// Received from the peer
    Input,
    /// Sent to the peer or to a receiver
    Output,
}

/// Events emitted by a session worker
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session state changed
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// A track was wired into the session
    TrackAdded {
        /// Input or output
        role: TrackRole,
        /// Media kind
        kind: MediaKind,
        /// Track id
        track_id: String,
    },
    /// The peer connection's transport state changed
    TransportStateChanged {
        /// New transport state
        state: TransportState,
    },
    /// A processor failed fatally and the session is being torn down
    ProcessorFailed {
        /// Media kind of the failing pipeline
        kind: MediaKind,
        /// Error description
        reason: String,
    },
}

impl SessionEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::TrackAdded { .. } => "track_added",
            SessionEvent::TransportStateChanged { .. } => "transport_state_changed",
            SessionEvent::ProcessorFailed { .. } => "processor_failed",
        }
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::ProcessorFailed { .. }
                | SessionEvent::TransportStateChanged {
                    state: TransportState::Failed
                }
        )
    }
}
