//! Shared fixtures for session tests: an in-memory peer connection and
//! helpers for driving tracks from the test thread.

#![allow(dead_code)]

use async_trait::async_trait;
use livepipe::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How `set_remote_description` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferBehaviour {
    Accept,
    Reject,
    Hang,
}

/// Peer connection that announces preset remote tracks when the offer is applied
pub struct FakePeer {
    remote_tracks: Vec<SharedTrack>,
    kinds: Vec<MediaKind>,
    behaviour: OfferBehaviour,
    track_handler: Mutex<Option<TrackHandler>>,
    state_handler: Mutex<Option<TransportStateHandler>>,
    added: Mutex<Vec<SharedTrack>>,
    local: Mutex<Option<SessionDescription>>,
    state: Mutex<TransportState>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn new(remote_tracks: Vec<SharedTrack>) -> Arc<Self> {
        let kinds = remote_tracks.iter().map(|track| track.kind()).collect();
        Self::build(remote_tracks, kinds, OfferBehaviour::Accept)
    }

    /// Offer carrying transceivers of `kinds` but no remote media
    pub fn receive_only(kinds: Vec<MediaKind>) -> Arc<Self> {
        Self::build(Vec::new(), kinds, OfferBehaviour::Accept)
    }

    pub fn with_behaviour(behaviour: OfferBehaviour) -> Arc<Self> {
        Self::build(Vec::new(), vec![MediaKind::Video], behaviour)
    }

    fn build(
        remote_tracks: Vec<SharedTrack>,
        kinds: Vec<MediaKind>,
        behaviour: OfferBehaviour,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_tracks,
            kinds,
            behaviour,
            track_handler: Mutex::new(None),
            state_handler: Mutex::new(None),
            added: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            state: Mutex::new(TransportState::New),
            closed: AtomicBool::new(false),
        })
    }

    pub fn added_tracks(&self) -> Vec<SharedTrack> {
        self.added.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a transport state change to the session
    pub fn emit_state(&self, state: TransportState) {
        *self.state.lock() = state;
        if let Some(handler) = self.state_handler.lock().as_ref() {
            handler(state);
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(handler);
    }

    fn on_transport_state_change(&self, handler: TransportStateHandler) {
        *self.state_handler.lock() = Some(handler);
    }

    async fn set_remote_description(&self, description: SessionDescription) -> PipelineResult<()> {
        assert_eq!(description.sdp_type, SdpType::Offer);
        match self.behaviour {
            OfferBehaviour::Reject => {
                return Err(PipelineError::Negotiation {
                    reason: "malformed offer".to_string(),
                })
            }
            OfferBehaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            OfferBehaviour::Accept => {}
        }
        *self.state.lock() = TransportState::Checking;
        if let Some(handler) = self.track_handler.lock().as_ref() {
            for track in &self.remote_tracks {
                handler(Arc::clone(track));
            }
        }
        Ok(())
    }

    async fn create_answer(&self) -> PipelineResult<SessionDescription> {
        Ok(SessionDescription::answer("v=0\r\ns=answer\r\n"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> PipelineResult<()> {
        *self.local.lock() = Some(description);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    fn add_track(&self, track: SharedTrack) -> PipelineResult<()> {
        self.added.lock().push(track);
        Ok(())
    }

    fn transceiver_kinds(&self) -> Vec<MediaKind> {
        self.kinds.clone()
    }

    fn transport_state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn close(&self) -> PipelineResult<()> {
        *self.state.lock() = TransportState::Closed;
        self.closed.store(true, Ordering::SeqCst);
        for track in self.added.lock().iter() {
            track.stop();
        }
        Ok(())
    }
}

pub fn offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\ns=offer\r\n")
}

pub fn pipe() -> LivePipe {
    LivePipe::init_with(GlobalConfig {
        worker_threads: Some(2),
        ..Default::default()
    })
    .unwrap()
}

pub fn video_frame(n: u8) -> Frame {
    Frame::video(2, 2, PixelFormat::Gray8, vec![n; 4]).with_timing(n as i64 * 3000, TimeBase::default())
}

/// Pull one frame from `track` on the pipe's runtime
pub fn recv(pipe: &LivePipe, track: &SharedTrack) -> Option<Frame> {
    pipe.runtime().block_on(async {
        tokio::time::timeout(Duration::from_secs(2), track.recv())
            .await
            .ok()?
            .ok()?
    })
}

pub fn wait_for(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
