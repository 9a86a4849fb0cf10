//! # livepipe core
//!
//! Foundations of the livepipe real-time media pipeline: the frame data model,
//! the pull-based [`MediaTrack`] abstraction, the fan-out [`MediaRelay`], the
//! bounded drop-oldest queue and the owned [`MediaRuntime`] every component
//! runs on.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod queue;
pub mod relay;
pub mod runtime;
pub mod track;

// Re-export main types
pub use error::{BoxError, ErrorCategory, PipelineError, PipelineResult};
pub use frame::{
    ChannelLayout, Frame, FrameFormat, MediaKind, PixelFormat, SampleFormat, TimeBase,
    AUDIO_PTIME, AUDIO_SAMPLE_RATE, VIDEO_CLOCK_RATE, VIDEO_PTIME,
};
pub use queue::{DropOldestQueue, PopError};
pub use relay::{MediaRelay, RelayTrack};
pub use runtime::{MediaRuntime, RuntimeOptions};
pub use track::{
    ChannelTrack, FrameSender, MediaTrack, ReadyState, RecvResult, SharedTrack, TrackLifecycle,
};
