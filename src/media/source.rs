use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Native geometry/timing of a live track, reported once the track has
/// loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

/// One live track of the source. Owned by the session from acquisition until
/// cleanup; stopping is idempotent.
pub struct MediaTrack {
    kind: TrackKind,
    stopped: CancellationToken,
    settings_rx: watch::Receiver<Option<TrackSettings>>,
    settings_tx: watch::Sender<Option<TrackSettings>>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        let (settings_tx, settings_rx) = watch::channel(None);
        Self {
            kind,
            stopped: CancellationToken::new(),
            settings_rx,
            settings_tx,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Report native settings. Producer side of the asynchronous "loaded"
    /// notification.
    pub fn set_settings(&self, settings: TrackSettings) {
        let _ = self.settings_tx.send(Some(settings));
    }

    /// Wait for the track's native settings; the source pushes them, the
    /// session never polls.
    pub async fn settings(&self) -> TrackSettings {
        let mut rx = self.settings_rx.clone();
        loop {
            if let Some(settings) = *rx.borrow() {
                return settings;
            }
            if rx.changed().await.is_err() {
                return TrackSettings::default();
            }
        }
    }

    /// Stop the track. Returns true only for the call that actually stopped
    /// it; double-stop is a no-op.
    pub fn stop(&self) -> bool {
        if self.stopped.is_cancelled() {
            return false;
        }
        self.stopped.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Token backends watch to flush and finish when the track stops.
    pub fn stop_token(&self) -> CancellationToken {
        self.stopped.clone()
    }
}

/// Live audio+video handle supplied by the acquisition collaborator.
pub struct MediaSource {
    audio: Arc<MediaTrack>,
    video: Arc<MediaTrack>,
}

impl MediaSource {
    pub fn live() -> Self {
        Self {
            audio: Arc::new(MediaTrack::new(TrackKind::Audio)),
            video: Arc::new(MediaTrack::new(TrackKind::Video)),
        }
    }

    pub fn audio_track(&self) -> &Arc<MediaTrack> {
        &self.audio
    }

    pub fn video_track(&self) -> &Arc<MediaTrack> {
        &self.video
    }

    pub fn tracks(&self) -> [&Arc<MediaTrack>; 2] {
        [&self.video, &self.audio]
    }

    /// Stop every track. Each track stops exactly once no matter how many
    /// exit paths run cleanup.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            if track.stop() {
                log::info!("stopped {:?} track", track.kind());
            }
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks().iter().all(|t| t.is_stopped())
    }
}
