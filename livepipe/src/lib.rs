//! # LivePipe - Server-side real-time media pipelines
//!
//! LivePipe sits next to a peer connection and turns the remote participant's
//! audio/video tracks into frame pipelines: user processors on dedicated
//! worker threads, a fixed-cadence mixer, polling receivers for synchronous
//! consumers and synthetic sources, all fanned out through a relay so one
//! track can feed many consumers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use livepipe::{LivePipe, PeerConnection, SessionDescription};
//! use std::sync::Arc;
//!
//! fn answer(
//!     peer: Arc<dyn PeerConnection>,
//!     offer: SessionDescription,
//! ) -> Result<SessionDescription, livepipe::PipelineError> {
//!     let pipe = LivePipe::init()?;
//!
//!     let session = pipe
//!         .session(peer)
//!         .video_frame_callback(|frame| Ok(frame.with_data(vec![0u8; frame.data.len()])))
//!         .build()?;
//!
//!     session.process_offer(offer, None)
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use livepipe_core::{
    ChannelLayout, ChannelTrack, ErrorCategory, Frame, FrameFormat, FrameSender, MediaKind,
    MediaRelay, MediaRuntime, MediaTrack, PipelineError, PipelineResult, PixelFormat,
    ReadyState, RecvResult, RelayTrack, RuntimeOptions, SampleFormat, SharedTrack, TimeBase,
};

pub use livepipe_media::{
    AsyncProcessTrack, CallbackProcessor, FrameGenerator, FrameProcessor, FrameReceiver,
    MediaSink, MixTrack, MixTrackConfig, Mixer, ProcessTrack, ProcessTrackConfig,
    ProcessorCallbacks, ProcessorFactory, ProcessorHandle, SinkFactory, SourceTrack,
};

// Public API modules
pub mod config;
pub mod event;
pub mod logging;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main API types
pub use config::{GlobalConfig, IceServer, RtcConfiguration, SessionConfig, SessionMode};
pub use event::{SessionEvent, SessionState, TrackRole};
pub use logging::init_logging;
pub use registry::TrackRegistry;
pub use session::{SessionWorker, SessionWorkerBuilder};
pub use transport::{
    PeerConnection, PeerConnectionFactory, SdpType, SessionDescription, TrackHandler,
    TransportState, TransportStateHandler,
};

use std::sync::Arc;
use tracing::info;

/// Main entry point: owns the runtime and the relay shared by all sessions
#[derive(Debug, Clone)]
pub struct LivePipe {
    inner: Arc<LivePipeInner>,
}

#[derive(Debug)]
struct LivePipeInner {
    runtime: MediaRuntime,
    relay: MediaRelay,
    config: GlobalConfig,
}

impl LivePipe {
    /// Initialize LivePipe with default settings
    ///
    /// # Example
    /// ```rust,no_run
    /// use livepipe::LivePipe;
    ///
    /// let pipe = LivePipe::init()?;
    /// # Ok::<(), livepipe::PipelineError>(())
    /// ```
    pub fn init() -> PipelineResult<Self> {
        Self::init_with(GlobalConfig::default())
    }

    /// Initialize with custom global configuration
    pub fn init_with(config: GlobalConfig) -> PipelineResult<Self> {
        config.validate()?;
        let runtime = MediaRuntime::with_options(RuntimeOptions {
            worker_threads: config.worker_threads,
            thread_name: config.thread_name.clone(),
        })?;
        info!(
            "🚀 LivePipe initialized (worker threads: {:?})",
            config.worker_threads
        );
        Ok(Self::build(runtime, config))
    }

    /// Use an existing runtime, e.g. the one the host application runs on
    pub fn from_runtime(runtime: MediaRuntime) -> Self {
        Self::build(runtime, GlobalConfig::default())
    }

    fn build(runtime: MediaRuntime, config: GlobalConfig) -> Self {
        let relay = MediaRelay::new(&runtime);
        Self {
            inner: Arc::new(LivePipeInner {
                runtime,
                relay,
                config,
            }),
        }
    }

    /// The runtime all pipeline tasks run on
    pub fn runtime(&self) -> &MediaRuntime {
        &self.inner.runtime
    }

    /// The shared relay
    pub fn relay(&self) -> &MediaRelay {
        &self.inner.relay
    }

    /// Global configuration
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    /// Builder for a session over `peer`
    pub fn session(&self, peer: Arc<dyn PeerConnection>) -> SessionWorkerBuilder {
        SessionWorkerBuilder::new(&self.inner.runtime, &self.inner.relay, peer)
    }

    /// Builder for a session whose peer connection is created by `factory`
    /// from the session's RTC configuration
    pub fn session_with<F>(&self, factory: F) -> SessionWorkerBuilder
    where
        F: FnOnce(&RtcConfiguration) -> PipelineResult<Arc<dyn PeerConnection>> + Send + 'static,
    {
        SessionWorkerBuilder::with_factory(&self.inner.runtime, &self.inner.relay, factory)
    }

    /// A new registry of shared process and mix tracks
    pub fn registry(&self) -> TrackRegistry {
        TrackRegistry::new(&self.inner.runtime, &self.inner.relay)
    }

    /// Stop the relay; every relay proxy observes end-of-stream
    pub fn shutdown(&self) {
        info!("LivePipe shutting down");
        self.inner.relay.stop();
    }
}
