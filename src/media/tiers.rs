use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::media::source::{MediaSource, MediaTrack, TrackSettings};
use crate::media::types::{
    BackendEvent, CapabilityError, SessionConfig, StartError, TIER_ORDER, TierId,
};

/// H.264 constrained baseline, the profile every mux destination accepts.
pub const VIDEO_ENCODER_CODEC: &str = "avc1.42E01E";
pub const AUDIO_ENCODER_CODEC: &str = "opus";

/// Chunk cadence requested from container recorders. The mux engine chunks
/// again anyway, so this only bounds latency.
pub const RECORDER_TIMESLICE: Duration = Duration::from_secs(1);

/// How long track-level negotiation waits for a track to report its native
/// settings before the tier is declared unavailable.
pub const SETTINGS_TIMEOUT: Duration = Duration::from_secs(1);

/// What a container recording should look like.
#[derive(Debug, Clone)]
pub struct RecorderSpec {
    pub container: &'static str,
    pub video_codec: &'static str,
    pub audio_bitrate: u64,
    pub video_bitrate: u64,
    pub timeslice: Duration,
}

/// Per-track encoder configuration for the track-level tier.
#[derive(Debug, Clone)]
pub struct TrackEncoderConfig {
    pub codec: String,
    pub bitrate: u64,
    pub key_frame_interval: u32,
    pub settings: TrackSettings,
}

/// Opaque encoding backends provided by the environment. Each call either
/// yields a running recording (compressed chunks until the tracks stop and
/// the backend flushes) or fails with a capability error. Dropping the
/// returned receiver abandons the recording.
pub trait EncoderStack: Send + Sync {
    /// Record the whole source into a streaming container.
    fn container_recorder(
        &self,
        source: &MediaSource,
        spec: &RecorderSpec,
    ) -> Result<mpsc::Receiver<BackendEvent>, CapabilityError>;

    /// Frame-level encoder for one track.
    fn track_encoder(
        &self,
        track: &Arc<MediaTrack>,
        config: &TrackEncoderConfig,
    ) -> Result<mpsc::Receiver<BackendEvent>, CapabilityError>;
}

/// The chosen tier's running backend.
pub enum ActiveBackend {
    Container {
        chunks: mpsc::Receiver<BackendEvent>,
    },
    TrackLevel {
        video: mpsc::Receiver<BackendEvent>,
        audio: mpsc::Receiver<BackendEvent>,
    },
}

/// Probe the tiers in fixed order and return the first that produces a
/// running pipeline. A tier that fails is abandoned for this session; there
/// is no retry within a tier.
pub async fn select_backend(
    stack: &dyn EncoderStack,
    source: &MediaSource,
    config: &SessionConfig,
) -> Result<(TierId, ActiveBackend), StartError> {
    for tier in TIER_ORDER {
        match try_tier(stack, source, config, tier).await {
            Ok(backend) => {
                log::info!("using encoder tier {:?} ({})", tier, tier.container());
                return Ok((tier, backend));
            }
            Err(e) => {
                log::warn!("encoder tier {:?} unavailable: {}", tier, e);
            }
        }
    }
    Err(StartError::AllBackendsFailed)
}

async fn try_tier(
    stack: &dyn EncoderStack,
    source: &MediaSource,
    config: &SessionConfig,
    tier: TierId,
) -> Result<ActiveBackend, CapabilityError> {
    match tier {
        TierId::ContainerH264 | TierId::ContainerMp4 => {
            let spec = RecorderSpec {
                container: tier.container(),
                video_codec: "h264",
                audio_bitrate: config.audio_bitrate,
                video_bitrate: config.video_bitrate,
                timeslice: RECORDER_TIMESLICE,
            };
            let chunks = stack.container_recorder(source, &spec)?;
            Ok(ActiveBackend::Container { chunks })
        }
        TierId::TrackLevel => {
            // negotiation needs the native geometry, reported asynchronously;
            // a track that never reports fails the tier, not the session
            let video_settings = track_settings(source.video_track()).await?;
            let audio_settings = track_settings(source.audio_track()).await?;

            let video = stack.track_encoder(
                source.video_track(),
                &TrackEncoderConfig {
                    codec: VIDEO_ENCODER_CODEC.to_string(),
                    bitrate: config.video_bitrate,
                    key_frame_interval: config.key_frame_interval,
                    settings: video_settings,
                },
            )?;
            let audio = stack.track_encoder(
                source.audio_track(),
                &TrackEncoderConfig {
                    codec: AUDIO_ENCODER_CODEC.to_string(),
                    bitrate: config.audio_bitrate,
                    key_frame_interval: 0,
                    settings: audio_settings,
                },
            )?;
            Ok(ActiveBackend::TrackLevel { video, audio })
        }
    }
}

async fn track_settings(track: &Arc<MediaTrack>) -> Result<TrackSettings, CapabilityError> {
    tokio::time::timeout(SETTINGS_TIMEOUT, track.settings())
        .await
        .map_err(|_| {
            CapabilityError(format!("{:?} track never reported settings", track.kind()))
        })
}
