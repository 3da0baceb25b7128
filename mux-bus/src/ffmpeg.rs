use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::OUTBOUND_DIR;
use crate::transcoder::{Transcoder, TranscoderEvent, TranscoderHandle};

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Spawns ffmpeg as the out-of-process mux engine.
///
/// The primary named input streams over the child's stdin (the argument
/// vector's reference to it is rewritten to `pipe:0`); further declared
/// names are reserved but not fed by this implementation. Each run gets its
/// own work directory, and `outbound/` inside it is polled for finished
/// segments and manifests.
pub struct FfmpegTranscoder {
    bin: String,
    work_root: PathBuf,
    poll_interval: Duration,
}

impl FfmpegTranscoder {
    pub fn new(bin: impl Into<String>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            work_root: work_root.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    async fn watch(
        mut child: Child,
        workdir: PathBuf,
        poll_interval: Duration,
        cancel: CancellationToken,
        ev_tx: mpsc::Sender<TranscoderEvent>,
    ) {
        // ffmpeg blocks reading stdin until the first bytes arrive, so the
        // run is consuming input from here on
        let _ = ev_tx.send(TranscoderEvent::StartStream).await;

        let outdir = workdir.join(OUTBOUND_DIR);
        let mut seen: HashMap<String, (u64, SystemTime)> = HashMap::new();
        let mut interval = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        log::debug!("ffmpeg kill: {}", e);
                    }
                    break;
                },
                status = child.wait() => {
                    // final sweep so the closing segments and manifest go out
                    Self::sweep(&outdir, &mut seen, &ev_tx).await;
                    let code = match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(e) => {
                            log::error!("ffmpeg wait: {}", e);
                            -1
                        }
                    };
                    log::info!("ffmpeg exited with status {}", code);
                    let _ = ev_tx.send(TranscoderEvent::Exited { status: code }).await;
                    break;
                },
                _ = interval.tick() => {
                    Self::sweep(&outdir, &mut seen, &ev_tx).await;
                },
            }
        }
    }

    /// Emits every file under the outbound dir whose size or mtime changed
    /// since the last sweep.
    ///
    /// TODO: only emit a media segment once the manifest references it, so a
    /// half-written segment is never pushed.
    async fn sweep(
        outdir: &Path,
        seen: &mut HashMap<String, (u64, SystemTime)>,
        ev_tx: &mpsc::Sender<TranscoderEvent>,
    ) {
        let mut dir = match tokio::fs::read_dir(outdir).await {
            Ok(dir) => dir,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let fingerprint = (meta.len(), meta.modified().unwrap_or(UNIX_EPOCH));
            if seen.get(&name) == Some(&fingerprint) {
                continue;
            }
            match tokio::fs::read(entry.path()).await {
                Ok(data) => {
                    seen.insert(name.clone(), fingerprint);
                    let _ = ev_tx
                        .send(TranscoderEvent::SegmentReady {
                            name,
                            data: Bytes::from(data),
                        })
                        .await;
                }
                Err(e) => {
                    log::warn!("read segment {}: {}", name, e);
                }
            }
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(
        &mut self,
        args: Vec<String>,
        inputs: Vec<String>,
    ) -> anyhow::Result<(Box<dyn TranscoderHandle>, mpsc::Receiver<TranscoderEvent>)> {
        let primary = inputs
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no named inputs declared"))?;

        let workdir = self.work_root.join(format!(
            "mux-{}-{}",
            std::process::id(),
            RUN_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::create_dir_all(workdir.join(OUTBOUND_DIR)).await?;

        let args: Vec<String> = args
            .iter()
            .map(|a| {
                if *a == primary {
                    "pipe:0".to_string()
                } else {
                    a.clone()
                }
            })
            .collect();

        log::info!("spawning {} {}", self.bin, args.join(" "));
        let mut child = Command::new(&self.bin)
            .args(&args)
            .current_dir(&workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {}: {}", self.bin, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdin not captured"))?;

        let (ev_tx, ev_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            Self::watch(child, workdir, poll_interval, cancel_clone, ev_tx).await;
        });

        let handle = FfmpegHandle {
            primary,
            stdin: Some(stdin),
            cancel,
        };
        Ok((Box::new(handle), ev_rx))
    }
}

struct FfmpegHandle {
    primary: String,
    stdin: Option<tokio::process::ChildStdin>,
    cancel: CancellationToken,
}

#[async_trait]
impl TranscoderHandle for FfmpegHandle {
    async fn write(&mut self, name: &str, data: Bytes) -> anyhow::Result<()> {
        if name != self.primary {
            log::warn!("dropping data for unfed input {}", name);
            return Ok(());
        }
        // input already ended: late writes are skipped
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        stdin.write_all(&data).await?;
        Ok(())
    }

    async fn end_input(&mut self, name: &str) -> anyhow::Result<()> {
        if name == self.primary {
            if let Some(mut stdin) = self.stdin.take() {
                // closing stdin is the drain signal
                let _ = stdin.shutdown().await;
            }
        }
        Ok(())
    }

    async fn kill(&mut self) {
        self.stdin = None;
        self.cancel.cancel();
    }
}
