//! Error types for the livepipe media pipeline

use std::time::Duration;
use thiserror::Error;

/// Boxed error carried by variants that wrap user callback failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used throughout the pipeline
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Operation timed out
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Component has been stopped or closed
    #[error("{component} is closed")]
    Closed {
        /// Component that is closed
        component: String,
    },

    /// A track is already attached to a single-track component
    #[error("A track is already attached: {track_id}")]
    TrackAlreadyAttached {
        /// Id of the track that is already attached
        track_id: String,
    },

    /// No track has been attached yet
    #[error("No track is attached")]
    NoTrack,

    /// Component was already started
    #[error("{component} has already been started")]
    AlreadyStarted {
        /// Component that was started twice
        component: String,
    },

    /// User processor failed
    #[error("Processor failed: {source}")]
    Processor {
        /// Underlying error
        source: BoxError,
    },

    /// User mixer failed
    #[error("Mixer failed: {source}")]
    Mixer {
        /// Underlying error
        source: BoxError,
    },

    /// A single processor invocation exceeded the watchdog ceiling
    #[error("Processor invocation stuck for {elapsed:?}")]
    ProcessorStuck {
        /// How long the invocation had been running
        elapsed: Duration,
    },

    /// Offer/answer negotiation failed
    #[error("Negotiation failed: {reason}")]
    Negotiation {
        /// Reason for failure
        reason: String,
    },

    /// Transport collaborator reported an error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Frame payload does not match its declared format
    #[error("Invalid frame data: expected {expected} bytes, got {actual}")]
    InvalidFrameData {
        /// Expected data size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// Track kind is not supported by the component
    #[error("Unsupported track kind: {kind}")]
    UnsupportedTrackKind {
        /// Track kind
        kind: String,
    },

    /// Runtime could not be created or used
    #[error("Runtime error: {reason}")]
    Runtime {
        /// Reason for runtime error
        reason: String,
    },

    /// Worker thread could not be spawned or joined
    #[error("Worker error: {reason}")]
    Worker {
        /// Reason for worker error
        reason: String,
    },
}

/// Error categories for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Timeouts and closed components
    Lifecycle,
    /// User processor and mixer failures
    UserCode,
    /// Negotiation and transport failures
    Transport,
    /// Configuration and state errors
    Configuration,
    /// Frame data errors
    Data,
    /// Thread and runtime errors
    System,
}

impl PipelineError {
    /// Wrap a processor failure
    pub fn processor(err: impl Into<BoxError>) -> Self {
        PipelineError::Processor { source: err.into() }
    }

    /// Wrap a mixer failure
    pub fn mixer(err: impl Into<BoxError>) -> Self {
        PipelineError::Mixer { source: err.into() }
    }

    /// Build a `Closed` error for the named component
    pub fn closed(component: impl Into<String>) -> Self {
        PipelineError::Closed {
            component: component.into(),
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Timeout { .. } => "TIMEOUT",
            PipelineError::Closed { .. } => "CLOSED",
            PipelineError::TrackAlreadyAttached { .. } => "TRACK_ALREADY_ATTACHED",
            PipelineError::NoTrack => "NO_TRACK",
            PipelineError::AlreadyStarted { .. } => "ALREADY_STARTED",
            PipelineError::Processor { .. } => "PROCESSOR_FAILED",
            PipelineError::Mixer { .. } => "MIXER_FAILED",
            PipelineError::ProcessorStuck { .. } => "PROCESSOR_STUCK",
            PipelineError::Negotiation { .. } => "NEGOTIATION_FAILED",
            PipelineError::Transport { .. } => "TRANSPORT_ERROR",
            PipelineError::InvalidState { .. } => "INVALID_STATE",
            PipelineError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            PipelineError::InvalidFrameData { .. } => "INVALID_FRAME_DATA",
            PipelineError::UnsupportedTrackKind { .. } => "UNSUPPORTED_TRACK_KIND",
            PipelineError::Runtime { .. } => "RUNTIME_ERROR",
            PipelineError::Worker { .. } => "WORKER_ERROR",
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Timeout { .. }
            | PipelineError::Closed { .. }
            | PipelineError::AlreadyStarted { .. } => ErrorCategory::Lifecycle,
            PipelineError::Processor { .. }
            | PipelineError::Mixer { .. }
            | PipelineError::ProcessorStuck { .. } => ErrorCategory::UserCode,
            PipelineError::Negotiation { .. } | PipelineError::Transport { .. } => {
                ErrorCategory::Transport
            }
            PipelineError::TrackAlreadyAttached { .. }
            | PipelineError::NoTrack
            | PipelineError::InvalidState { .. }
            | PipelineError::InvalidConfiguration { .. }
            | PipelineError::UnsupportedTrackKind { .. } => ErrorCategory::Configuration,
            PipelineError::InvalidFrameData { .. } => ErrorCategory::Data,
            PipelineError::Runtime { .. } | PipelineError::Worker { .. } => ErrorCategory::System,
        }
    }

    /// Whether the caller can reasonably retry or continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout { .. }
                | PipelineError::Mixer { .. }
                | PipelineError::InvalidFrameData { .. }
        )
    }
}
