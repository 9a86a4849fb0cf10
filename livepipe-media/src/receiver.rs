//! Polling adapter from an asynchronous track to a synchronous consumer
//!
//! A [`FrameReceiver`] pumps one track into a bounded drop-oldest queue that any
//! thread can poll with [`FrameReceiver::get_frame`]. Real-time media never
//! waits on a full queue; the oldest unread frame is evicted instead.

use livepipe_core::{
    DropOldestQueue, Frame, MediaRuntime, PipelineError, PipelineResult, PopError, SharedTrack,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default queue capacity
pub const DEFAULT_RECEIVER_CAPACITY: usize = 4;

#[derive(Default)]
struct ReceiverState {
    track: Option<SharedTrack>,
    pump: Option<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

/// Bounded, thread-safe frame queue fed by one track
pub struct FrameReceiver {
    handle: Handle,
    queue: Arc<DropOldestQueue<Frame>>,
    state: Mutex<ReceiverState>,
    overflow_warned: Arc<AtomicBool>,
}

impl FrameReceiver {
    /// Create a receiver with the default capacity
    pub fn new(runtime: &MediaRuntime) -> Self {
        Self::with_capacity(runtime, DEFAULT_RECEIVER_CAPACITY)
    }

    /// Create a receiver holding at most `capacity` frames
    pub fn with_capacity(runtime: &MediaRuntime, capacity: usize) -> Self {
        Self {
            handle: runtime.handle().clone(),
            queue: Arc::new(DropOldestQueue::new(capacity)),
            state: Mutex::new(ReceiverState::default()),
            overflow_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach the track to pump. Only one track may ever be attached.
    pub fn add_track(&self, track: SharedTrack) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = &state.track {
            return Err(PipelineError::TrackAlreadyAttached {
                track_id: existing.id().to_string(),
            });
        }
        debug!("Receiver attached to track {} ({})", track.id(), track.kind());
        state.track = Some(track);
        Ok(())
    }

    /// Whether a track has been attached
    pub fn has_track(&self) -> bool {
        self.state.lock().track.is_some()
    }

    /// The attached track
    pub fn track(&self) -> Option<SharedTrack> {
        self.state.lock().track.clone()
    }

    /// Start pumping the attached track into the queue
    pub fn start(&self) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(PipelineError::closed("Frame receiver"));
        }
        if state.started {
            return Err(PipelineError::AlreadyStarted {
                component: "Frame receiver".to_string(),
            });
        }
        let track = state.track.clone().ok_or(PipelineError::NoTrack)?;
        let queue = Arc::clone(&self.queue);
        let overflow_warned = Arc::clone(&self.overflow_warned);

        info!("📥 Starting receiver for track {}", track.id());
        state.pump = Some(self.handle.spawn(async move {
            loop {
                match track.recv().await {
                    Ok(Some(frame)) => {
                        if queue.push(frame).is_some() {
                            if !overflow_warned.swap(true, Ordering::SeqCst) {
                                warn!(
                                    "Receiver queue for track {} is full; dropping the oldest frame. \
                                     The consumer is not keeping up with real time.",
                                    track.id()
                                );
                            } else {
                                debug!(
                                    "Receiver for track {} dropped a frame ({} so far)",
                                    track.id(),
                                    queue.dropped()
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("Receiver track {} ended", track.id());
                        break;
                    }
                    Err(e) => {
                        warn!("Receiver track {} failed: {}", track.id(), e);
                        break;
                    }
                }
            }
            queue.close();
        }));
        state.started = true;
        Ok(())
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Wait for one frame. `None` waits without a deadline.
    ///
    /// Fails with `Timeout` when nothing arrives in time and with `Closed` once
    /// the receiver is stopped or its track has ended and the queue is drained.
    pub fn get_frame(&self, timeout: Option<Duration>) -> PipelineResult<Frame> {
        self.queue
            .pop_blocking(timeout)
            .map_err(|e| self.pop_error(e, timeout))
    }

    /// Wait for at least one frame, then return everything queued, oldest first
    pub fn get_frames(&self, timeout: Option<Duration>) -> PipelineResult<Vec<Frame>> {
        self.queue
            .drain_blocking(timeout)
            .map_err(|e| self.pop_error(e, timeout))
    }

    /// Wait for one frame from async code
    pub async fn recv_frame(&self) -> PipelineResult<Frame> {
        self.queue
            .pop()
            .await
            .ok_or_else(|| PipelineError::closed("Frame receiver"))
    }

    /// Number of frames evicted by overflow so far
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    /// Cancel the pump. Subsequent polls fail with `Closed`. Idempotent.
    pub fn stop(&self) {
        let pump = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.pump.take()
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        self.queue.close();
        self.queue.drain();
        debug!("Receiver stopped");
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn pop_error(&self, error: PopError, timeout: Option<Duration>) -> PipelineError {
        match error {
            PopError::Timeout => PipelineError::Timeout {
                operation: "get_frame".to_string(),
                duration: timeout.unwrap_or_default(),
            },
            PopError::Closed => PipelineError::closed("Frame receiver"),
        }
    }
}

impl fmt::Debug for FrameReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FrameReceiver")
            .field("capacity", &self.queue.capacity())
            .field("track", &state.track.as_ref().map(|t| t.id().to_string()))
            .field("started", &state.started)
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        if let Some(pump) = self.state.lock().pump.take() {
            pump.abort();
        }
    }
}
