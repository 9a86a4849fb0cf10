//! Track abstraction
//!
//! A track is an ordered, pull-based stream of frames. [`MediaTrack::recv`]
//! resolves to `Ok(Some(frame))` for the next frame, `Ok(None)` once the track
//! has ended, and `Err` on failure.

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Outcome of pulling one frame from a track
pub type RecvResult = PipelineResult<Option<Frame>>;

/// Shared handle to any track
pub type SharedTrack = Arc<dyn MediaTrack>;

/// Track ready state; `Ended` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// Frames may still be produced
    Live,
    /// No more frames will be produced
    Ended,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyState::Live => f.write_str("live"),
            ReadyState::Ended => f.write_str("ended"),
        }
    }
}

/// Identity and ready state shared by every track implementation
#[derive(Debug)]
pub struct TrackLifecycle {
    id: String,
    kind: MediaKind,
    state: watch::Sender<ReadyState>,
}

impl TrackLifecycle {
    /// Create a live lifecycle with a fresh id
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    /// Create a live lifecycle with the given id
    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Self {
        let (state, _) = watch::channel(ReadyState::Live);
        Self {
            id: id.into(),
            kind,
            state,
        }
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Current ready state
    pub fn state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Whether the track is still live
    pub fn is_live(&self) -> bool {
        self.state() == ReadyState::Live
    }

    /// Move to `Ended`. Returns true only for the call that made the transition.
    pub fn end(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ReadyState::Live {
                *state = ReadyState::Ended;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("🔄 Track {} ({}) state changed: live -> ended", self.id, self.kind);
        }
        changed
    }

    /// Resolve once the track has ended
    pub async fn ended(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == ReadyState::Ended {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// An ordered, pull-based stream of timestamped frames
#[async_trait]
pub trait MediaTrack: Send + Sync + 'static {
    /// Identity and ready state of this track
    fn lifecycle(&self) -> &TrackLifecycle;

    /// Pull the next frame, waiting until one is available or the track ends
    async fn recv(&self) -> RecvResult;

    /// Stop the track. Idempotent; a pending `recv` observes end-of-stream.
    fn stop(&self) {
        self.lifecycle().end();
    }

    /// Track id
    fn id(&self) -> &str {
        self.lifecycle().id()
    }

    /// Track kind
    fn kind(&self) -> MediaKind {
        self.lifecycle().kind()
    }

    /// Current ready state
    fn ready_state(&self) -> ReadyState {
        self.lifecycle().state()
    }
}

/// Sending half of a [`ChannelTrack`]
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender {
    /// Push a frame into the track
    pub fn send(&self, frame: Frame) -> PipelineResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| PipelineError::closed("Channel track"))
    }

    /// Whether the receiving track is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A track fed by the host through a [`FrameSender`]
///
/// The track ends once every sender is dropped and the queued frames have been
/// received, or when it is stopped.
pub struct ChannelTrack {
    lifecycle: TrackLifecycle,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl ChannelTrack {
    /// Create a track together with its sender
    pub fn new(kind: MediaKind) -> (Arc<Self>, FrameSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            lifecycle: TrackLifecycle::new(kind),
            rx: Mutex::new(rx),
        });
        (track, FrameSender { tx })
    }
}

impl fmt::Debug for ChannelTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTrack")
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

#[async_trait]
impl MediaTrack for ChannelTrack {
    fn lifecycle(&self) -> &TrackLifecycle {
        &self.lifecycle
    }

    async fn recv(&self) -> RecvResult {
        if !self.lifecycle.is_live() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => Ok(Some(frame)),
                None => {
                    self.lifecycle.end();
                    Ok(None)
                }
            },
            _ = self.lifecycle.ended() => Ok(None),
        }
    }

    fn stop(&self) {
        self.lifecycle.end();
    }
}
