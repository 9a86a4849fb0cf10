//! # livepipe media
//!
//! Frame processing stages of the livepipe pipeline. Every stage is itself a
//! [`MediaTrack`](livepipe_core::MediaTrack), so stages compose freely:
//!
//! - [`ProcessTrack`] and [`AsyncProcessTrack`] apply a [`FrameProcessor`]
//! - [`MixTrack`] fans several inputs into one through a [`Mixer`]
//! - [`FrameReceiver`] lets a synchronous consumer poll a track
//! - [`SourceTrack`] produces live-generated frames
//! - [`MediaSink`] is the interface for recorders

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod mix;
pub mod process;
pub mod processor;
pub mod receiver;
pub mod sink;
pub mod source;

// Re-export main types
pub use mix::{MixTrack, MixTrackConfig};
pub use process::{AsyncProcessTrack, FatalHandler, ProcessTrack, ProcessTrackConfig};
pub use processor::{
    CallbackProcessor, EndedCallback, FrameCallback, FrameProcessor, Mixer, ProcessorCallbacks,
    ProcessorFactory, ProcessorHandle, QueuedFramesCallback,
};
pub use receiver::{FrameReceiver, DEFAULT_RECEIVER_CAPACITY};
pub use sink::{MediaSink, SinkFactory};
pub use source::{FrameGenerator, SourceTrack};
