//! Frame data model
//!
//! A [`Frame`] is one unit of audio or video payload together with its
//! presentation timestamp (`pts`) and `time_base`. Absolute presentation time is
//! `pts * time_base` seconds.

use crate::error::{PipelineError, PipelineResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// RTP clock rate used for video timestamps
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Sample rate used for audio timestamps
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Frame interval of live-generated video (30 fps)
pub const VIDEO_PTIME: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// Packetization interval of live-generated audio
pub const AUDIO_PTIME: Duration = Duration::from_millis(20);

/// Kind of media carried by a track or frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio samples
    Audio,
    /// Video pictures
    Video,
}

impl MediaKind {
    /// Clock rate conventionally used for this kind
    pub fn clock_rate(&self) -> u32 {
        match self {
            MediaKind::Audio => AUDIO_SAMPLE_RATE,
            MediaKind::Video => VIDEO_CLOCK_RATE,
        }
    }

    /// Time base conventionally used for this kind
    pub fn time_base(&self) -> TimeBase {
        TimeBase::from_rate(self.clock_rate())
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rational number of seconds per `pts` tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    /// Numerator
    pub num: u32,
    /// Denominator
    pub den: u32,
}

impl TimeBase {
    /// Create a time base of `num/den` seconds per tick
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Time base of one tick per `1/rate` seconds
    pub const fn from_rate(rate: u32) -> Self {
        Self { num: 1, den: rate }
    }

    /// Presentation time in seconds of the given `pts`
    pub fn seconds(&self, pts: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        pts as f64 * self.num as f64 / self.den as f64
    }

    /// Number of ticks covering `duration`, rounded down
    pub fn ticks(&self, duration: Duration) -> i64 {
        if self.num == 0 {
            return 0;
        }
        let ticks = duration.as_nanos() * self.den as u128 / (self.num as u128 * 1_000_000_000);
        i64::try_from(ticks).unwrap_or(i64::MAX)
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        TimeBase::from_rate(VIDEO_CLOCK_RATE)
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Supported raw video pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit blue, green, red
    Bgr24,
    /// Packed 8-bit red, green, blue
    Rgb24,
    /// Packed 8-bit red, green, blue, alpha
    Rgba,
    /// Planar 4:2:0 YUV
    Yuv420p,
    /// Semi-planar 4:2:0 YUV
    Nv12,
    /// Single 8-bit luma plane
    Gray8,
}

impl PixelFormat {
    /// Payload size in bytes of a `width` x `height` picture
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Rgba => pixels * 4,
            PixelFormat::Gray8 => pixels,
            PixelFormat::Yuv420p | PixelFormat::Nv12 => {
                let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
                pixels + 2 * chroma
            }
        }
    }
}

/// Audio channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    /// One channel
    Mono,
    /// Two interleaved channels
    Stereo,
}

impl ChannelLayout {
    /// Number of channels
    pub fn channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// Audio sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed 16-bit interleaved
    S16,
    /// 32-bit float interleaved
    F32,
}

impl SampleFormat {
    /// Size of a single sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Kind-specific frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Raw video picture
    Video {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Pixel layout
        pixel_format: PixelFormat,
    },
    /// Raw audio samples
    Audio {
        /// Samples per second
        sample_rate: u32,
        /// Channel layout
        layout: ChannelLayout,
        /// Sample format
        sample_format: SampleFormat,
        /// Samples per channel
        samples: u32,
    },
}

/// One unit of media payload with timing
///
/// Frames are immutable by convention. The payload is reference counted so
/// cloning a frame for fan-out does not copy pixel or sample data.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Presentation timestamp in `time_base` ticks
    pub pts: i64,
    /// Seconds per `pts` tick
    pub time_base: TimeBase,
    /// Raw pixel or sample data
    pub data: Bytes,
    /// Kind-specific metadata
    pub format: FrameFormat,
}

impl Frame {
    /// Create a video frame with zero `pts` on the video clock
    pub fn video(width: u32, height: u32, pixel_format: PixelFormat, data: impl Into<Bytes>) -> Self {
        Self {
            pts: 0,
            time_base: TimeBase::from_rate(VIDEO_CLOCK_RATE),
            data: data.into(),
            format: FrameFormat::Video {
                width,
                height,
                pixel_format,
            },
        }
    }

    /// Create an audio frame with zero `pts` on the sample clock
    pub fn audio(
        sample_rate: u32,
        layout: ChannelLayout,
        sample_format: SampleFormat,
        samples: u32,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            pts: 0,
            time_base: TimeBase::from_rate(sample_rate),
            data: data.into(),
            format: FrameFormat::Audio {
                sample_rate,
                layout,
                sample_format,
                samples,
            },
        }
    }

    /// Media kind of this frame
    pub fn kind(&self) -> MediaKind {
        match self.format {
            FrameFormat::Video { .. } => MediaKind::Video,
            FrameFormat::Audio { .. } => MediaKind::Audio,
        }
    }

    /// Return this frame with the given timing
    pub fn with_timing(mut self, pts: i64, time_base: TimeBase) -> Self {
        self.pts = pts;
        self.time_base = time_base;
        self
    }

    /// Copy `pts` and `time_base` from another frame
    pub fn copy_timing_from(&mut self, other: &Frame) {
        self.pts = other.pts;
        self.time_base = other.time_base;
    }

    /// Return a frame with the same metadata and timing but a new payload
    pub fn with_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            pts: self.pts,
            time_base: self.time_base,
            data: data.into(),
            format: self.format,
        }
    }

    /// Absolute presentation time in seconds
    pub fn time(&self) -> f64 {
        self.time_base.seconds(self.pts)
    }

    /// Check that the payload size matches the declared format
    pub fn validate(&self) -> PipelineResult<()> {
        let expected = match self.format {
            FrameFormat::Video {
                width,
                height,
                pixel_format,
            } => pixel_format.frame_size(width, height),
            FrameFormat::Audio {
                layout,
                sample_format,
                samples,
                ..
            } => samples as usize * layout.channels() * sample_format.bytes_per_sample(),
        };
        if self.data.len() != expected {
            return Err(PipelineError::InvalidFrameData {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }
}
