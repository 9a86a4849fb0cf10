//! Peer connection collaborator interface
//!
//! ICE, DTLS/SRTP and codec negotiation live in an external peer-connection
//! library. The session worker only needs the offer/answer calls, the
//! `track` and transport-state events, and the ability to add outgoing
//! tracks, which is what [`PeerConnection`] declares.

use crate::config::RtcConfiguration;
use async_trait::async_trait;
use livepipe_core::{MediaKind, PipelineResult, SharedTrack};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Roll back to the last stable state
    Rollback,
}

/// An SDP blob and its type, in the JSON shape browsers exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Raw SDP
    pub sdp: String,
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    /// An offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    /// An answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

/// ICE transport state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not started
    New,
    /// Connectivity checks running
    Checking,
    /// Usable pair found
    Connected,
    /// Checks finished
    Completed,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Shut down
    Closed,
}

impl TransportState {
    /// Whether media can no longer flow
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Completed => "completed",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handler for remote tracks
pub type TrackHandler = Box<dyn Fn(SharedTrack) + Send + Sync>;

/// Handler for transport state changes
pub type TransportStateHandler = Box<dyn Fn(TransportState) + Send + Sync>;

/// The surface of a peer connection the session worker drives
///
/// Handlers may be invoked from any thread, including from inside
/// `set_remote_description`.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Register the handler called for every remote track
    fn on_track(&self, handler: TrackHandler);

    /// Register the handler called on transport state changes
    fn on_transport_state_change(&self, handler: TransportStateHandler);

    /// Apply the remote offer
    async fn set_remote_description(&self, description: SessionDescription)
        -> PipelineResult<()>;

    /// Create an answer for the applied offer
    async fn create_answer(&self) -> PipelineResult<SessionDescription>;

    /// Apply the local answer
    async fn set_local_description(&self, description: SessionDescription)
        -> PipelineResult<()>;

    /// Current local description
    fn local_description(&self) -> Option<SessionDescription>;

    /// Add an outgoing track
    fn add_track(&self, track: SharedTrack) -> PipelineResult<()>;

    /// Media kinds of the transceivers created by the remote offer
    fn transceiver_kinds(&self) -> Vec<MediaKind>;

    /// Current transport state
    fn transport_state(&self) -> TransportState;

    /// Close the connection and stop its tracks
    async fn close(&self) -> PipelineResult<()>;
}

/// Builds a peer connection from the session's RTC configuration
pub type PeerConnectionFactory =
    Box<dyn FnOnce(&RtcConfiguration) -> PipelineResult<Arc<dyn PeerConnection>> + Send>;
