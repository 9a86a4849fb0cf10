//! Live-generated source tracks
//!
//! A [`SourceTrack`] is not derived from any incoming track. It paces itself at
//! a fixed packetization interval (video: 1/30 s on the 90 kHz clock, audio:
//! 20 ms on the 48 kHz clock) and either repeats its current buffer or calls a
//! generator for every tick.

use async_trait::async_trait;
use livepipe_core::{
    Frame, MediaKind, MediaTrack, PipelineError, PipelineResult, RecvResult, TimeBase,
    TrackLifecycle, AUDIO_PTIME, VIDEO_PTIME,
};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Produces the frame for a tick from its `pts` and `time_base`
pub trait FrameGenerator: Send + Sync + 'static {
    /// Build the frame for this tick. Timing is stamped by the source.
    fn generate(&self, pts: i64, time_base: TimeBase) -> anyhow::Result<Frame>;
}

impl<F> FrameGenerator for F
where
    F: Fn(i64, TimeBase) -> anyhow::Result<Frame> + Send + Sync + 'static,
{
    fn generate(&self, pts: i64, time_base: TimeBase) -> anyhow::Result<Frame> {
        self(pts, time_base)
    }
}

enum SourceContent {
    Buffer(Mutex<Frame>),
    Generator(Box<dyn FrameGenerator>),
}

struct SourceClock {
    started_at: Option<Instant>,
    pts: i64,
}

/// Track producing live-generated frames at a fixed cadence
pub struct SourceTrack {
    lifecycle: TrackLifecycle,
    content: SourceContent,
    ptime: Duration,
    time_base: TimeBase,
    pts_step: i64,
    clock: tokio::sync::Mutex<SourceClock>,
}

impl SourceTrack {
    /// Video source repeating `initial` until replaced with [`SourceTrack::update`]
    pub fn video(initial: Frame) -> PipelineResult<Self> {
        Self::from_buffer(MediaKind::Video, initial)
    }

    /// Audio source repeating `initial` until replaced with [`SourceTrack::update`]
    pub fn audio(initial: Frame) -> PipelineResult<Self> {
        Self::from_buffer(MediaKind::Audio, initial)
    }

    /// Source calling `generator` once per tick
    pub fn generated(kind: MediaKind, generator: impl FrameGenerator) -> Self {
        Self::build(kind, SourceContent::Generator(Box::new(generator)))
    }

    fn from_buffer(kind: MediaKind, initial: Frame) -> PipelineResult<Self> {
        if initial.kind() != kind {
            return Err(PipelineError::UnsupportedTrackKind {
                kind: initial.kind().to_string(),
            });
        }
        Ok(Self::build(kind, SourceContent::Buffer(Mutex::new(initial))))
    }

    fn build(kind: MediaKind, content: SourceContent) -> Self {
        let ptime = match kind {
            MediaKind::Video => VIDEO_PTIME,
            MediaKind::Audio => AUDIO_PTIME,
        };
        let clock_rate = kind.clock_rate();
        let pts_step = match kind {
            MediaKind::Video => (clock_rate / 30) as i64,
            MediaKind::Audio => (clock_rate / 50) as i64,
        };
        let lifecycle = TrackLifecycle::new(kind);
        debug!("Creating {} source track {}", kind, lifecycle.id());
        Self {
            lifecycle,
            content,
            ptime,
            time_base: TimeBase::from_rate(clock_rate),
            pts_step,
            clock: tokio::sync::Mutex::new(SourceClock {
                started_at: None,
                pts: 0,
            }),
        }
    }

    /// Replace the repeated frame; the newest update wins
    pub fn update(&self, frame: Frame) -> PipelineResult<()> {
        match &self.content {
            SourceContent::Buffer(buffer) => {
                if frame.kind() != self.lifecycle.kind() {
                    return Err(PipelineError::UnsupportedTrackKind {
                        kind: frame.kind().to_string(),
                    });
                }
                *buffer.lock() = frame;
                Ok(())
            }
            SourceContent::Generator(_) => Err(PipelineError::InvalidState {
                expected: "buffer source".to_string(),
                actual: "generator source".to_string(),
            }),
        }
    }

    /// Interval between two frames
    pub fn ptime(&self) -> Duration {
        self.ptime
    }

    fn current_frame(&self, pts: i64) -> PipelineResult<Frame> {
        let frame = match &self.content {
            SourceContent::Buffer(buffer) => buffer.lock().clone(),
            SourceContent::Generator(generator) => generator
                .generate(pts, self.time_base)
                .map_err(PipelineError::processor)?,
        };
        Ok(frame.with_timing(pts, self.time_base))
    }
}

impl fmt::Debug for SourceTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTrack")
            .field("id", &self.lifecycle.id())
            .field("kind", &self.lifecycle.kind())
            .field("ptime", &self.ptime)
            .finish()
    }
}

#[async_trait]
impl MediaTrack for SourceTrack {
    fn lifecycle(&self) -> &TrackLifecycle {
        &self.lifecycle
    }

    async fn recv(&self) -> RecvResult {
        if !self.lifecycle.is_live() {
            return Ok(None);
        }
        let mut clock = self.clock.lock().await;
        let pts = match clock.started_at {
            None => {
                clock.started_at = Some(Instant::now());
                clock.pts = 0;
                0
            }
            Some(started_at) => {
                clock.pts += self.pts_step;
                let due = started_at
                    + Duration::from_secs_f64(self.time_base.seconds(clock.pts));
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => {}
                    _ = self.lifecycle.ended() => return Ok(None),
                }
                clock.pts
            }
        };
        self.current_frame(pts).map(Some)
    }
}
