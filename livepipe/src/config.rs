//! Configuration types and defaults

use livepipe_core::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default log directive used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Global LivePipe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Runtime worker threads (`None` uses the tokio default)
    pub worker_threads: Option<usize>,
    /// Name given to runtime threads
    pub thread_name: String,
    /// Log directive used by [`crate::logging::init_logging`] when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "livepipe-runtime".to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl GlobalConfig {
    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.worker_threads == Some(0) {
            return Err(invalid("Worker thread count must be > 0"));
        }
        if self.thread_name.is_empty() {
            return Err(invalid("Runtime thread name must not be empty"));
        }
        Ok(())
    }
}

/// Direction of media for a session, from this side of the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Receive remote tracks, process them and send the result back
    #[default]
    SendRecv,
    /// Receive remote tracks into frame receivers for polling
    RecvOnly,
    /// Send locally generated source tracks only
    SendOnly,
}

impl SessionMode {
    /// Whether incoming tracks are consumed in this mode
    pub fn receives(&self) -> bool {
        matches!(self, SessionMode::SendRecv | SessionMode::RecvOnly)
    }

    /// Whether tracks are added to the outgoing connection in this mode
    pub fn sends(&self) -> bool {
        matches!(self, SessionMode::SendRecv | SessionMode::SendOnly)
    }
}

/// One STUN or TURN server entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// TURN user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn is_turn(url: &str) -> bool {
        url.starts_with("turn:") || url.starts_with("turns:")
    }

    /// Validate URLs and credentials
    pub fn validate(&self) -> PipelineResult<()> {
        if self.urls.is_empty() {
            return Err(invalid("ICE server must have at least one URL"));
        }
        for url in &self.urls {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !known {
                return Err(invalid(format!("Unsupported ICE server URL: {}", url)));
            }
            if Self::is_turn(url) && (self.username.is_none() || self.credential.is_none()) {
                return Err(invalid(format!(
                    "TURN server {} requires a username and credential",
                    url
                )));
            }
        }
        Ok(())
    }
}

/// Configuration handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    /// ICE servers used for connectivity checks
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
        }
    }
}

impl RtcConfiguration {
    /// Configuration without any ICE server (host candidates only)
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }

    /// Validate every server entry
    pub fn validate(&self) -> PipelineResult<()> {
        self.ice_servers.iter().try_for_each(IceServer::validate)
    }
}

/// Per-session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Media direction
    pub mode: SessionMode,
    /// Run processors on a dedicated worker thread instead of inline
    pub async_processing: bool,
    /// Send processed video back to the peer
    pub sendback_video: bool,
    /// Send processed audio back to the peer
    pub sendback_audio: bool,
    /// Capacity of the video frame receiver
    pub video_receiver_size: usize,
    /// Capacity of the audio frame receiver
    pub audio_receiver_size: usize,
    /// Upper bound for `process_offer` when the caller passes no timeout
    pub negotiation_timeout: Duration,
    /// Time allowed for worker threads to exit on stop
    pub stop_timeout: Duration,
    /// Longest a single processor invocation may run before the session is torn down
    pub processor_watchdog: Duration,
    /// Peer connection configuration
    pub rtc_configuration: RtcConfiguration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::default(),
            async_processing: true,
            sendback_video: true,
            sendback_audio: true,
            video_receiver_size: 4,
            audio_receiver_size: 4,
            negotiation_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
            processor_watchdog: Duration::from_secs(10),
            rtc_configuration: RtcConfiguration::default(),
        }
    }
}

impl SessionConfig {
    /// Send/receive session processing incoming media
    pub fn send_recv() -> Self {
        Self::default()
    }

    /// Receive-only session feeding frame receivers
    pub fn recv_only() -> Self {
        Self {
            mode: SessionMode::RecvOnly,
            ..Default::default()
        }
    }

    /// Send-only session streaming source tracks
    pub fn send_only() -> Self {
        Self {
            mode: SessionMode::SendOnly,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.video_receiver_size == 0 || self.audio_receiver_size == 0 {
            return Err(invalid("Receiver size must be > 0"));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(invalid("Negotiation timeout must be > 0"));
        }
        if self.processor_watchdog.is_zero() {
            return Err(invalid("Processor watchdog must be > 0"));
        }
        self.rtc_configuration.validate()
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfiguration {
        message: message.into(),
    }
}
