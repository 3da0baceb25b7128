use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use mux_bus::ffmpeg::FfmpegTranscoder;
use mux_bus::publisher::HttpPublisher;
use tokio::sync::RwLock;

use crate::config;
use crate::media::{
    pipeline::Pipeline,
    source::{MediaSource, TrackSettings},
    stack::FfmpegStack,
    types::SessionConfig,
};

static SESSION_MANAGER: LazyLock<RwLock<HashMap<String, Arc<Pipeline>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

pub(crate) fn get_session_manager() -> &'static RwLock<HashMap<String, Arc<Pipeline>>> {
    &SESSION_MANAGER
}

pub(crate) async fn add_session(id: &str, config: SessionConfig) -> anyhow::Result<()> {
    let mut sessions = SESSION_MANAGER.write().await;
    if sessions.contains_key(id) {
        return Err(anyhow::anyhow!("session already exists"));
    }

    let app = config::config();
    let stack = FfmpegStack::new(
        app.ffmpeg_bin(),
        app.video_format(),
        app.video_input(),
        app.audio_format(),
        app.audio_input(),
        config.frame_rate,
    );
    let transcoder = FfmpegTranscoder::new(app.ffmpeg_bin(), app.work_dir());
    let publisher = HttpPublisher::new();

    // capture devices are configured, not negotiated; report the configured
    // geometry so track-level setup does not wait on a device callback
    let source = MediaSource::live();
    source.video_track().set_settings(TrackSettings {
        width: app.video_width(),
        height: app.video_height(),
        ..TrackSettings::default()
    });
    source.audio_track().set_settings(TrackSettings {
        sample_rate: app.audio_sample_rate(),
        channels: app.audio_channels(),
        ..TrackSettings::default()
    });

    let pipeline = Arc::new(Pipeline::new(
        config,
        source,
        Box::new(stack),
        Box::new(transcoder),
        Box::new(publisher),
    ));
    sessions.insert(id.to_string(), Arc::clone(&pipeline));

    let session_id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = pipeline.start().await {
            log::error!("starting session {}: {:#}", session_id, e);
        }
    });
    Ok(())
}

/// Ask a session to end. The session stays listed until removed so its
/// terminal state stays queryable.
pub(crate) async fn end_session(id: &str, force: bool) -> anyhow::Result<()> {
    let sessions = SESSION_MANAGER.read().await;
    match sessions.get(id) {
        Some(pipeline) => {
            pipeline.end(force);
            Ok(())
        }
        None => Err(anyhow::anyhow!("session not found")),
    }
}

pub(crate) async fn remove_session(id: &str) -> anyhow::Result<()> {
    let mut sessions = SESSION_MANAGER.write().await;
    if let Some(pipeline) = sessions.remove(id) {
        pipeline.end(true);
    }
    Ok(())
}

pub(crate) async fn get_session(id: &str) -> Option<Arc<Pipeline>> {
    SESSION_MANAGER.read().await.get(id).cloned()
}

pub(crate) async fn shutdown() {
    let mut sessions = SESSION_MANAGER.write().await;
    for (id, pipeline) in sessions.drain() {
        log::info!("force ending session {}", id);
        pipeline.end(true);
    }
}
