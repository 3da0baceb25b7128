use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    protocol::{ContainerFlavor, ExitCode, MuxCommand, MuxEvent, PublishMethod},
    publisher::Publisher,
    transcoder::{Transcoder, TranscoderEvent, TranscoderHandle},
};

/// Relative manifest path inside the transcoder work directory. Segments land
/// next to it and are named relative to this directory when published.
pub const OUTBOUND_DIR: &str = "outbound";

/// Build the full transcoder argument vector for a segmented run: the
/// orchestrator's codec/mapping arguments wrapped with the segmenting options
/// for the requested container flavor.
pub fn run_args(flavor: ContainerFlavor, codec_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec!["-seekable".into(), "0".into()];
    args.extend(codec_args.iter().cloned());
    match flavor {
        ContainerFlavor::Hls => {
            args.extend(
                [
                    "-f",
                    "hls",
                    "-hls_time",
                    "2",
                    "-hls_segment_type",
                    "mpegts",
                    "-hls_list_size",
                    "2",
                    "-hls_flags",
                    "split_by_time",
                ]
                .map(String::from),
            );
            args.push(format!("{}/{}", OUTBOUND_DIR, flavor.manifest_name()));
        }
        ContainerFlavor::Dash => {
            args.extend(
                [
                    "-f",
                    "dash",
                    "-seg_duration",
                    "2",
                    "-window_size",
                    "2",
                    "-streaming",
                    "1",
                    "-dash_segment_type",
                    "webm",
                ]
                .map(String::from),
            );
            args.push(format!("{}/{}", OUTBOUND_DIR, flavor.manifest_name()));
        }
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Ready,
    Running,
    Draining,
    Exited,
}

/// Handle to a mux engine peer: owns the transcoder process lifecycle and
/// translates between `MuxCommand`/`MuxEvent` and the raw process.
///
/// All sends are fire-and-forget; the peer's next action is always driven by
/// a received message. After `Exit` the peer is gone and further commands are
/// silently dropped.
pub struct MuxEngine {
    cancel: CancellationToken,
    tx: mpsc::Sender<MuxCommand>,
}

impl MuxEngine {
    /// Spawn a peer. `Ready` is always delivered asynchronously after this
    /// returns, so the caller holds the event receiver before it fires.
    pub fn spawn(
        transcoder: Box<dyn Transcoder>,
        publisher: Box<dyn Publisher>,
    ) -> (Self, mpsc::Receiver<MuxEvent>) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1024);
        let (events_tx, events_rx) = mpsc::channel(256);

        let inner = EngineInner {
            state: EngineState::Ready,
            transcoder: Some(transcoder),
            handle: None,
            publisher,
            inputs: Vec::new(),
            pending: Vec::new(),
            backlog: Vec::new(),
            sending: false,
            events: events_tx,
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, inner).await });

        (Self { cancel, tx }, events_rx)
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<MuxCommand>,
        mut inner: EngineInner,
    ) {
        // ready fires from the spawned task, never during construction
        if inner.events.send(MuxEvent::Ready).await.is_err() {
            return;
        }

        let mut proc_rx: Option<mpsc::Receiver<TranscoderEvent>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(handle) = inner.handle.as_mut() {
                        handle.kill().await;
                    }
                    break;
                },
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Err(e) = Self::handle_command(&mut inner, &mut proc_rx, cmd).await {
                                log::error!("mux engine command error: {:#}", e);
                                let _ = inner
                                    .events
                                    .send(MuxEvent::Error { detail: format!("{:#}", e) })
                                    .await;
                            }
                        }
                        None => {
                            // owner dropped the handle without ending the run
                            if let Some(handle) = inner.handle.as_mut() {
                                handle.kill().await;
                            }
                            break;
                        }
                    }
                },
                ev = recv_proc(&mut proc_rx), if proc_rx.is_some() => {
                    match ev {
                        Some(ev) => Self::handle_process_event(&mut inner, ev).await,
                        None => proc_rx = None,
                    }
                },
            }

            if inner.state == EngineState::Exited {
                break;
            }
        }
    }

    async fn handle_command(
        inner: &mut EngineInner,
        proc_rx: &mut Option<mpsc::Receiver<TranscoderEvent>>,
        cmd: MuxCommand,
    ) -> anyhow::Result<()> {
        match cmd {
            MuxCommand::Run { args, inputs } => {
                if inner.state != EngineState::Ready {
                    log::warn!("run ignored in state {:?}", inner.state);
                    return Ok(());
                }
                let mut transcoder = inner
                    .transcoder
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("transcoder already consumed"))?;
                match transcoder.spawn(args, inputs.clone()).await {
                    Ok((handle, rx)) => {
                        inner.handle = Some(handle);
                        inner.inputs = inputs;
                        *proc_rx = Some(rx);
                        inner.state = EngineState::Running;
                        // stream data that raced ahead of the spawn goes
                        // out first, in arrival order
                        let backlog = std::mem::take(&mut inner.backlog);
                        if let Some(handle) = inner.handle.as_mut() {
                            for (name, chunk) in backlog {
                                match chunk {
                                    Some(data) => handle.write(&name, data).await?,
                                    None => handle.end_input(&name).await?,
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("transcoder spawn failed: {:#}", e);
                        let _ = inner
                            .events
                            .send(MuxEvent::Error {
                                detail: format!("{:#}", e),
                            })
                            .await;
                        Self::exit(inner, ExitCode::Code(1)).await;
                    }
                }
            }
            MuxCommand::StreamData { name, data } => {
                // handle is released on exit; late data is skipped, not an error
                if let Some(handle) = inner.handle.as_mut() {
                    handle.write(&name, data).await?;
                } else if inner.state == EngineState::Ready {
                    // the run has not spawned yet; hold the head of the stream
                    inner.backlog.push((name, Some(data)));
                }
            }
            MuxCommand::StreamEnd { name } => {
                if let Some(handle) = inner.handle.as_mut() {
                    handle.end_input(&name).await?;
                } else if inner.state == EngineState::Ready {
                    inner.backlog.push((name, None));
                }
            }
            MuxCommand::BaseUrl { url, method } => {
                inner.publisher.set_destination(url, method);
                let pending = std::mem::take(&mut inner.pending);
                for (name, data) in pending {
                    Self::publish(inner, &name, data).await;
                }
            }
            MuxCommand::End { force } => {
                if force {
                    if let Some(mut handle) = inner.handle.take() {
                        handle.kill().await;
                    }
                    // synthesized locally, not round-tripped through the process
                    Self::exit(inner, ExitCode::ForceEnd).await;
                } else if inner.handle.is_some() {
                    inner.state = EngineState::Draining;
                    let names = inner.inputs.clone();
                    if let Some(handle) = inner.handle.as_mut() {
                        for name in &names {
                            handle.end_input(name).await?;
                        }
                    }
                } else {
                    Self::exit(inner, ExitCode::ForceEnd).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_process_event(inner: &mut EngineInner, ev: TranscoderEvent) {
        match ev {
            TranscoderEvent::StartStream => {
                let _ = inner.events.send(MuxEvent::StartStream).await;
            }
            TranscoderEvent::SegmentReady { name, data } => {
                if inner.publisher.has_destination() {
                    Self::publish(inner, &name, data).await;
                } else {
                    // finished before the base-url handshake completed
                    inner.pending.push((name, data));
                }
            }
            TranscoderEvent::Fatal { detail } => {
                if inner.handle.is_some() {
                    let _ = inner.events.send(MuxEvent::Error { detail }).await;
                }
            }
            TranscoderEvent::Aborted { detail } => {
                if inner.handle.is_some() {
                    let _ = inner.events.send(MuxEvent::Abort { detail }).await;
                }
            }
            TranscoderEvent::Exited { status } => {
                Self::exit(inner, ExitCode::Code(status)).await;
            }
        }
    }

    async fn publish(inner: &mut EngineInner, name: &str, data: Bytes) {
        match inner.publisher.publish(name, data).await {
            Ok(()) => {
                if !inner.sending {
                    inner.sending = true;
                    let _ = inner.events.send(MuxEvent::Sending).await;
                }
            }
            Err(e) => {
                log::warn!("publish {} failed: {:#}", name, e);
                let _ = inner
                    .events
                    .send(MuxEvent::Error {
                        detail: format!("publish {}: {:#}", name, e),
                    })
                    .await;
            }
        }
    }

    async fn exit(inner: &mut EngineInner, code: ExitCode) {
        if inner.state == EngineState::Exited {
            return;
        }
        inner.state = EngineState::Exited;
        inner.handle = None;
        let _ = inner.events.send(MuxEvent::Exit { code }).await;
    }

    /// Fire-and-forget send. Returns false when the peer is gone (exited or
    /// channel full); the command is dropped either way.
    pub fn send(&self, cmd: MuxCommand) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("mux engine command dropped: {}", e);
                false
            }
        }
    }

    pub fn run(&self, args: Vec<String>, inputs: Vec<String>) -> bool {
        self.send(MuxCommand::Run { args, inputs })
    }

    pub fn stream_data(&self, name: &str, data: Bytes) -> bool {
        self.send(MuxCommand::StreamData {
            name: name.to_string(),
            data,
        })
    }

    pub fn stream_end(&self, name: &str) -> bool {
        self.send(MuxCommand::StreamEnd {
            name: name.to_string(),
        })
    }

    pub fn base_url(&self, url: &str, method: PublishMethod) -> bool {
        self.send(MuxCommand::BaseUrl {
            url: url.to_string(),
            method,
        })
    }

    pub fn end(&self, force: bool) -> bool {
        self.send(MuxCommand::End { force })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MuxEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn recv_proc(rx: &mut Option<mpsc::Receiver<TranscoderEvent>>) -> Option<TranscoderEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

struct EngineInner {
    state: EngineState,
    transcoder: Option<Box<dyn Transcoder>>,
    handle: Option<Box<dyn TranscoderHandle>>,
    publisher: Box<dyn Publisher>,
    inputs: Vec<String>,
    pending: Vec<(String, Bytes)>,
    /// Stream data received before the run spawned; `None` marks an end of
    /// input. Flushed in order once the process is up.
    backlog: Vec<(String, Option<Bytes>)>,
    sending: bool,
    events: mpsc::Sender<MuxEvent>,
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
