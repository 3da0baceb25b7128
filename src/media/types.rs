use bytes::Bytes;
use thiserror::Error;

use mux_bus::protocol::{ContainerFlavor, ExitCode};

/// Default audio bitrate fed to encoders and the mux engine (bps).
pub const AUDIO_BITS_PER_SECOND: u64 = 128 * 1000;
/// Default video bitrate (bps).
pub const VIDEO_BITS_PER_SECOND: u64 = 2500 * 1000;
/// Default key frame interval for track-level encoding (seconds).
pub const KEY_FRAME_INTERVAL_SECS: u32 = 3;

/// Public lifecycle of a session. Transitions are monotonic; `Exited` is
/// terminal and every externally triggerable action is a no-op once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Ending,
    Exited,
}

impl LifecycleState {
    pub fn can_transition_to(&self, target: &LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, target) {
            (Idle, Starting) => true,
            (Starting, Running) => true,
            // cancelled or failed before the start handshake completed
            (Starting, Ending) => true,
            (Starting, Exited) => true,
            (Running, Ending) => true,
            (Running, Exited) => true,
            (Ending, Exited) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Exited)
    }

    pub fn description(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Ending => "ending",
            LifecycleState::Exited => "exited",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// One of the fixed-order encoder strategies attempted during start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierId {
    /// Tier A: record the whole source into a streaming container, H.264.
    ContainerH264,
    /// Tier B: per-track encoder workers feeding the muxing peer.
    TrackLevel,
    /// Tier C: container recording with the broadly compatible MP4 pairing.
    ContainerMp4,
}

/// Fixed probe order. Never reordered based on past outcomes; every session
/// re-probes from the top.
pub const TIER_ORDER: [TierId; 3] = [
    TierId::ContainerH264,
    TierId::TrackLevel,
    TierId::ContainerMp4,
];

impl TierId {
    /// Container format the tier records into.
    pub fn container(&self) -> &'static str {
        match self {
            TierId::ContainerH264 => "webm",
            TierId::TrackLevel => "webm",
            TierId::ContainerMp4 => "mp4",
        }
    }

    /// MP4 recordings already carry AAC audio; the WebM tiers need the mux
    /// engine to re-encode audio as AAC.
    pub fn needs_audio_reencode(&self) -> bool {
        !matches!(self, TierId::ContainerMp4)
    }
}

/// Events surfaced to the session's caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The pipeline is live and producing output.
    Start {
        tier: TierId,
        container: &'static str,
    },
    /// Heartbeat tick for per-frame maintenance work. Informational.
    Update,
    /// Non-terminal advisory. A terminating error is always followed by
    /// exactly one `Exit`.
    Error { detail: String },
    /// Terminal. Fires exactly once; nothing is emitted after it.
    Exit { code: ExitCode },
}

/// Configuration of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub destination_url: String,
    pub flavor: ContainerFlavor,
    /// Heartbeat ticks per second, normally the source frame rate.
    pub frame_rate: u32,
    /// Lock to portrait: injects rotation metadata into the mux run.
    pub rotate: bool,
    pub audio_bitrate: u64,
    pub video_bitrate: u64,
    pub key_frame_interval: u32,
}

impl SessionConfig {
    pub fn new(destination_url: impl Into<String>, flavor: ContainerFlavor) -> Self {
        Self {
            destination_url: destination_url.into(),
            flavor,
            frame_rate: 30,
            rotate: false,
            audio_bitrate: AUDIO_BITS_PER_SECOND,
            video_bitrate: VIDEO_BITS_PER_SECOND,
            key_frame_interval: KEY_FRAME_INTERVAL_SECS,
        }
    }
}

/// Output of an opaque encoder backend: compressed chunks until the backend
/// flushes and closes its channel.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Data(Bytes),
    Error(String),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("all encoder backends failed")]
    AllBackendsFailed,
}

/// A tier cannot be satisfied by the current environment. Recovered locally
/// by advancing to the next tier.
#[derive(Debug, Error)]
#[error("capability not available: {0}")]
pub struct CapabilityError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_is_monotonic() {
        use LifecycleState::*;

        assert!(Idle.can_transition_to(&Starting));
        assert!(Starting.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Ending));
        assert!(Ending.can_transition_to(&Exited));
        assert!(Starting.can_transition_to(&Exited));

        // no transition skips backward
        assert!(!Running.can_transition_to(&Starting));
        assert!(!Ending.can_transition_to(&Running));
        assert!(!Exited.can_transition_to(&Idle));
        assert!(!Exited.can_transition_to(&Running));
        assert!(!Exited.can_transition_to(&Ending));
    }

    #[test]
    fn test_tier_order_is_fixed() {
        assert_eq!(
            TIER_ORDER,
            [
                TierId::ContainerH264,
                TierId::TrackLevel,
                TierId::ContainerMp4
            ]
        );
        assert_eq!(TierId::ContainerMp4.container(), "mp4");
        assert!(!TierId::ContainerMp4.needs_audio_reencode());
        assert!(TierId::ContainerH264.needs_audio_reencode());
    }
}
