//! Recording sink interface
//!
//! Sinks such as container muxers consume tracks like any other consumer: the
//! session hands them relay proxies, starts them once wiring is complete and
//! stops them when the recorded input ends or the session is torn down.

use async_trait::async_trait;
use livepipe_core::{PipelineResult, SharedTrack};
use std::sync::Arc;

/// Consumer that records one or more tracks
#[async_trait]
pub trait MediaSink: Send + Sync + 'static {
    /// Register a track to record. Called before `start`.
    fn add_track(&self, track: SharedTrack) -> PipelineResult<()>;

    /// Begin consuming the registered tracks
    async fn start(&self) -> PipelineResult<()>;

    /// Stop consuming and finalize the output
    async fn stop(&self) -> PipelineResult<()>;
}

/// Zero-argument constructor for sinks
pub type SinkFactory = Arc<dyn Fn() -> Arc<dyn MediaSink> + Send + Sync>;
