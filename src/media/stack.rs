use std::process::Stdio;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::media::source::{MediaSource, MediaTrack, TrackKind};
use crate::media::tiers::{EncoderStack, RecorderSpec, TrackEncoderConfig};
use crate::media::types::{BackendEvent, CapabilityError, KEY_FRAME_INTERVAL_SECS};

/// Map a requested codec to the ffmpeg encoder that produces it. An unknown
/// codec fails the tier so selection can move on.
fn encoder_for(codec: &str) -> Result<&'static str, CapabilityError> {
    if codec == "h264" || codec.starts_with("avc1") {
        Ok("libx264")
    } else if codec == "opus" {
        Ok("libopus")
    } else {
        Err(CapabilityError(format!("no encoder for codec {}", codec)))
    }
}

const CAPTURE_CHANNEL: usize = 64;
const READ_CHUNK: usize = 64 * 1024;

/// Capture-and-encode backends built on an ffmpeg child process per
/// recording. Chunks are whatever the muxer writes to stdout; the track stop
/// token kills the child and the reader drains stdout to EOF.
pub struct FfmpegStack {
    bin: String,
    video_format: String,
    video_input: String,
    audio_format: String,
    audio_input: String,
    frame_rate: u32,
}

impl FfmpegStack {
    pub fn new(
        bin: &str,
        video_format: &str,
        video_input: &str,
        audio_format: &str,
        audio_input: &str,
        frame_rate: u32,
    ) -> Self {
        Self {
            bin: bin.to_string(),
            video_format: video_format.to_string(),
            video_input: video_input.to_string(),
            audio_format: audio_format.to_string(),
            audio_input: audio_input.to_string(),
            frame_rate: frame_rate.max(1),
        }
    }

    fn container_args(&self, spec: &RecorderSpec) -> Result<Vec<String>, CapabilityError> {
        let mut args: Vec<String> = vec![
            "-f".into(),
            self.video_format.clone(),
            "-framerate".into(),
            self.frame_rate.to_string(),
            "-i".into(),
            self.video_input.clone(),
            "-f".into(),
            self.audio_format.clone(),
            "-i".into(),
            self.audio_input.clone(),
            "-c:v".into(),
            encoder_for(spec.video_codec)?.into(),
            "-preset".into(),
            "veryfast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-b:v".into(),
            spec.video_bitrate.to_string(),
            "-g".into(),
            (self.frame_rate * KEY_FRAME_INTERVAL_SECS).to_string(),
        ];
        match spec.container {
            "mp4" => {
                args.extend(
                    ["-c:a", "aac", "-b:a", &spec.audio_bitrate.to_string()]
                        .map(String::from),
                );
                // stdout is not seekable, so the moov has to be fragmented;
                // fragment cadence doubles as the requested chunk cadence
                let frag = spec.timeslice.as_micros().to_string();
                args.extend(
                    [
                        "-movflags",
                        "frag_keyframe+empty_moov",
                        "-frag_duration",
                        &frag,
                        "-f",
                        "mp4",
                    ]
                    .map(String::from),
                );
            }
            _ => {
                args.extend(
                    ["-c:a", "libopus", "-b:a", &spec.audio_bitrate.to_string()]
                        .map(String::from),
                );
                // h264 in webm is out of spec for ffmpeg, matroska carries it;
                // clusters are cut at the requested chunk cadence
                let cluster = spec.timeslice.as_millis().to_string();
                args.extend(
                    ["-cluster_time_limit", &cluster, "-f", "matroska"].map(String::from),
                );
            }
        }
        args.push("pipe:1".into());
        Ok(args)
    }

    fn track_args(
        &self,
        kind: TrackKind,
        config: &TrackEncoderConfig,
    ) -> Result<Vec<String>, CapabilityError> {
        let encoder = encoder_for(&config.codec)?;
        let mut args: Vec<String> = Vec::new();
        match kind {
            TrackKind::Video => {
                args.extend(
                    [
                        "-f",
                        &self.video_format,
                        "-framerate",
                        &self.frame_rate.to_string(),
                        "-i",
                        &self.video_input,
                        "-an",
                        "-c:v",
                        encoder,
                        "-preset",
                        "veryfast",
                        "-tune",
                        "zerolatency",
                        "-b:v",
                        &config.bitrate.to_string(),
                        "-g",
                        &(self.frame_rate * config.key_frame_interval.max(1)).to_string(),
                    ]
                    .map(String::from),
                );
                let s = config.settings;
                if s.width > 0 && s.height > 0 {
                    args.extend(["-s".into(), format!("{}x{}", s.width, s.height)]);
                }
            }
            TrackKind::Audio => {
                args.extend(
                    [
                        "-f",
                        &self.audio_format,
                        "-i",
                        &self.audio_input,
                        "-vn",
                        "-c:a",
                        encoder,
                        "-b:a",
                        &config.bitrate.to_string(),
                    ]
                    .map(String::from),
                );
                let s = config.settings;
                if s.sample_rate > 0 {
                    args.extend(["-ar".into(), s.sample_rate.to_string()]);
                }
                if s.channels > 0 {
                    args.extend(["-ac".into(), s.channels.to_string()]);
                }
            }
        }
        args.extend(["-f", "matroska", "pipe:1"].map(String::from));
        Ok(args)
    }

    fn spawn_capture(
        &self,
        args: Vec<String>,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendEvent>, CapabilityError> {
        log::info!("spawning capture: {} {}", self.bin, args.join(" "));
        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapabilityError(format!("spawn {} failed: {}", self.bin, e)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapabilityError("capture process has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL);
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            let mut killed = false;
            loop {
                tokio::select! {
                    _ = stop.cancelled(), if !killed => {
                        killed = true;
                        if let Err(e) = child.start_kill() {
                            log::warn!("killing capture process: {:#}", e);
                        }
                        // keep reading, stdout drains to EOF after the kill
                    }
                    read = stdout.read_buf(&mut buf) => {
                        match read {
                            Ok(0) => break,
                            Ok(_) => {
                                if tx.send(BackendEvent::Data(buf.split().freeze())).await.is_err() {
                                    // receiver gone, recording abandoned
                                    let _ = child.start_kill();
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx
                                    .send(BackendEvent::Error(format!("capture read: {}", e)))
                                    .await;
                                let _ = child.start_kill();
                                break;
                            }
                        }
                    }
                }
            }
            match child.wait().await {
                Ok(status) if status.success() || killed => {
                    log::info!("capture process finished: {}", status);
                }
                Ok(status) => {
                    let _ = tx
                        .send(BackendEvent::Error(format!(
                            "capture process failed: {}",
                            status
                        )))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(BackendEvent::Error(format!("capture process wait: {}", e)))
                        .await;
                }
            }
        });
        Ok(rx)
    }
}

impl EncoderStack for FfmpegStack {
    fn container_recorder(
        &self,
        source: &MediaSource,
        spec: &RecorderSpec,
    ) -> Result<mpsc::Receiver<BackendEvent>, CapabilityError> {
        // stop_all cancels every track, watching the video one is enough
        let stop = source.video_track().stop_token();
        self.spawn_capture(self.container_args(spec)?, stop)
    }

    fn track_encoder(
        &self,
        track: &Arc<MediaTrack>,
        config: &TrackEncoderConfig,
    ) -> Result<mpsc::Receiver<BackendEvent>, CapabilityError> {
        self.spawn_capture(self.track_args(track.kind(), config)?, track.stop_token())
    }
}
