use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mux_bus::engine::{MuxEngine, run_args};
use mux_bus::protocol::{ContainerFlavor, ExitCode, MuxEvent};
use mux_bus::publisher::Publisher;
use mux_bus::transcoder::Transcoder;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};

use crate::media::heartbeat::HeartbeatDriver;
use crate::media::source::MediaSource;
use crate::media::tiers::{ActiveBackend, EncoderStack, select_backend};
use crate::media::types::{LifecycleState, PipelineEvent, SessionConfig, TierId};
use crate::media::workers::{EncoderWorker, WorkerEvent};

/// Mux input names. The container tiers feed one stream, the track-level
/// tier feeds video and audio separately.
pub const VIDEO_STREAM: &str = "stream1";
pub const AUDIO_STREAM: &str = "stream2";

const CTL_CHANNEL: usize = 16;
const RELAY_CHANNEL: usize = 64;
const EVENT_CHANNEL: usize = 256;

enum SessionCtl {
    End { force: bool },
}

struct StartParts {
    stack: Box<dyn EncoderStack>,
    transcoder: Box<dyn Transcoder>,
    publisher: Box<dyn Publisher>,
    ctl_rx: mpsc::Receiver<SessionCtl>,
}

/// One encode-and-publish session. Owns the encoder tier selection, the
/// worker fan-in, the heartbeat and the mux engine; surfaces progress as
/// broadcast [`PipelineEvent`]s, with exactly one terminal `Exit`.
pub struct Pipeline {
    config: SessionConfig,
    source: Arc<MediaSource>,
    events: broadcast::Sender<PipelineEvent>,
    state_tx: Arc<watch::Sender<LifecycleState>>,
    state_rx: watch::Receiver<LifecycleState>,
    ctl: mpsc::Sender<SessionCtl>,
    started: AtomicBool,
    end_requested: Arc<AtomicBool>,
    parts: Mutex<Option<StartParts>>,
}

impl Pipeline {
    pub fn new(
        config: SessionConfig,
        source: MediaSource,
        stack: Box<dyn EncoderStack>,
        transcoder: Box<dyn Transcoder>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL);
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (ctl, ctl_rx) = mpsc::channel(CTL_CHANNEL);
        Self {
            config,
            source: Arc::new(source),
            events,
            state_tx: Arc::new(state_tx),
            state_rx,
            ctl,
            started: AtomicBool::new(false),
            end_requested: Arc::new(AtomicBool::new(false)),
            parts: Mutex::new(Some(StartParts {
                stack,
                transcoder,
                publisher,
                ctl_rx,
            })),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Select an encoder tier and go live. Idempotent: a second call does
    /// nothing and reports success. Resolves once the mux destination
    /// handshake completed (or the pipeline died trying).
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("pipeline already started");
            return Ok(());
        }
        set_state(&self.state_tx, LifecycleState::Starting);

        let parts = match self.parts.lock().await.take() {
            Some(parts) => parts,
            None => return Err(anyhow::anyhow!("pipeline components already consumed")),
        };
        let (tier, backend) =
            match select_backend(parts.stack.as_ref(), &self.source, &self.config).await {
                Ok(selected) => selected,
                Err(e) => {
                    self.source.stop_all();
                    set_state(&self.state_tx, LifecycleState::Exited);
                    return Err(e.into());
                }
            };

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver {
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            events: self.events.clone(),
            state_tx: Arc::clone(&self.state_tx),
            end_requested: Arc::clone(&self.end_requested),
        };
        tokio::spawn(driver.run(
            tier,
            backend,
            parts.transcoder,
            parts.publisher,
            parts.ctl_rx,
            ready_tx,
        ));

        if ready_rx.await.is_err() {
            log::warn!("pipeline exited before going live");
        }
        Ok(())
    }

    /// Request the end of the session. `force` skips the graceful drain;
    /// a graceful request is upgraded to forced by the driver when nothing
    /// was ever published. No-op before start and after exit.
    pub fn end(&self, force: bool) {
        let state = self.state();
        if state == LifecycleState::Idle || state.is_terminal() {
            return;
        }
        if state == LifecycleState::Starting {
            self.end_requested.store(true, Ordering::SeqCst);
        }
        if self.ctl.try_send(SessionCtl::End { force }).is_err() {
            log::warn!("pipeline end request dropped");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.end(true);
    }
}

struct Driver {
    config: SessionConfig,
    source: Arc<MediaSource>,
    events: broadcast::Sender<PipelineEvent>,
    state_tx: Arc<watch::Sender<LifecycleState>>,
    end_requested: Arc<AtomicBool>,
}

impl Driver {
    async fn run(
        self,
        tier: TierId,
        backend: ActiveBackend,
        transcoder: Box<dyn Transcoder>,
        publisher: Box<dyn Publisher>,
        mut ctl_rx: mpsc::Receiver<SessionCtl>,
        ready_tx: oneshot::Sender<()>,
    ) {
        // the alternate container needs per-track streams, every other tier
        // publishes HLS
        let flavor = if tier == TierId::TrackLevel {
            self.config.flavor
        } else {
            if self.config.flavor != ContainerFlavor::Hls {
                log::warn!(
                    "{:?} output needs the track-level encoder tier, falling back to HLS",
                    self.config.flavor
                );
            }
            ContainerFlavor::Hls
        };

        let (relay_tx, mut relay_rx) = mpsc::channel(RELAY_CHANNEL);
        let workers: Vec<EncoderWorker> = match backend {
            ActiveBackend::Container { chunks } => {
                vec![EncoderWorker::spawn(VIDEO_STREAM, chunks, relay_tx)]
            }
            ActiveBackend::TrackLevel { video, audio } => vec![
                EncoderWorker::spawn(VIDEO_STREAM, video, relay_tx.clone()),
                EncoderWorker::spawn(AUDIO_STREAM, audio, relay_tx),
            ],
        };
        let inputs: Vec<String> = workers.iter().map(|w| w.name().to_string()).collect();
        let mux_args = run_args(flavor, &codec_args(tier, &self.config));

        let (heartbeat, mut ticks) = HeartbeatDriver::start(self.config.frame_rate);
        let (engine, mut engine_events) = MuxEngine::spawn(transcoder, publisher);

        let mut ready_tx = Some(ready_tx);
        let mut sending = false;
        let mut ending = false;
        let mut live = false;
        let mut exited_workers = 0usize;
        let mut ticks_open = true;
        let mut relay_open = true;
        let mut ctl_open = true;

        let final_code = loop {
            tokio::select! {
                ev = engine_events.recv() => match ev {
                    Some(MuxEvent::Ready) => {
                        engine.run(mux_args.clone(), inputs.clone());
                    }
                    Some(MuxEvent::StartStream) => {
                        engine.base_url(&self.config.destination_url, flavor.publish_method());
                        live = true;
                        set_state(&self.state_tx, LifecycleState::Running);
                        self.emit(PipelineEvent::Start {
                            tier,
                            container: tier.container(),
                        });
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                        if self.end_requested.swap(false, Ordering::SeqCst) && !ending {
                            // an end arrived while we were still starting;
                            // nothing was published yet, so it is forced
                            ending = true;
                            live = false;
                            set_state(&self.state_tx, LifecycleState::Ending);
                            heartbeat.suspend();
                            engine.end(true);
                            self.source.stop_all();
                        }
                    }
                    Some(MuxEvent::Sending) => {
                        sending = true;
                    }
                    Some(MuxEvent::Error { detail }) | Some(MuxEvent::Abort { detail }) => {
                        self.emit(PipelineEvent::Error { detail });
                    }
                    Some(MuxEvent::Exit { code }) => {
                        // a forced end before anything was published is a
                        // clean stop, not a failure
                        if code == ExitCode::ForceEnd && !sending {
                            break ExitCode::Code(0);
                        }
                        break code;
                    }
                    None => {
                        log::error!("mux engine channel closed without an exit report");
                        break ExitCode::Code(-1);
                    }
                },
                worker = relay_rx.recv(), if relay_open => match worker {
                    Some(WorkerEvent::Data { name, data }) => {
                        engine.stream_data(name, data);
                    }
                    Some(WorkerEvent::Error { name, detail }) => {
                        self.emit(PipelineEvent::Error {
                            detail: format!("{}: {}", name, detail),
                        });
                    }
                    Some(WorkerEvent::Exited { name }) => {
                        engine.stream_end(name);
                        exited_workers += 1;
                        if exited_workers == workers.len() {
                            if !ending {
                                // the source dried up on its own
                                ending = true;
                                live = false;
                                set_state(&self.state_tx, LifecycleState::Ending);
                                heartbeat.suspend();
                            }
                            engine.end(false);
                        }
                    }
                    None => {
                        relay_open = false;
                    }
                },
                ctl = ctl_rx.recv(), if ctl_open => {
                    let force = match ctl {
                        Some(SessionCtl::End { force }) => force,
                        None => {
                            // the handle is gone, tear down hard
                            ctl_open = false;
                            true
                        }
                    };
                    if ending {
                        if force {
                            // a stalled drain must not outlive a forced end;
                            // kill the run and report the exit ourselves
                            engine.end(true);
                            break if sending {
                                ExitCode::ForceEnd
                            } else {
                                ExitCode::Code(0)
                            };
                        }
                        continue;
                    }
                    // with no publish yet there is nothing to drain
                    let forced = force || !sending;
                    ending = true;
                    live = false;
                    set_state(&self.state_tx, LifecycleState::Ending);
                    heartbeat.suspend();
                    if forced {
                        engine.end(true);
                    }
                    self.source.stop_all();
                },
                tick = ticks.recv(), if ticks_open => match tick {
                    Some(()) => {
                        if live {
                            self.emit(PipelineEvent::Update);
                        }
                    }
                    None => {
                        ticks_open = false;
                    }
                },
            }
        };

        heartbeat.stop();
        for worker in &workers {
            worker.stop();
        }
        engine.stop();
        self.source.stop_all();
        set_state(&self.state_tx, LifecycleState::Exited);
        self.emit(PipelineEvent::Exit { code: final_code });
        log::info!("pipeline exited: {}", final_code);
    }

    fn emit(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn set_state(state_tx: &watch::Sender<LifecycleState>, next: LifecycleState) {
    state_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        if !current.can_transition_to(&next) {
            log::warn!("ignoring lifecycle transition {} -> {}", current, next);
            return false;
        }
        log::info!("pipeline {} -> {}", current, next);
        *current = next;
        true
    });
}

fn codec_args(tier: TierId, config: &SessionConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["-i".into(), VIDEO_STREAM.into()];
    if tier == TierId::TrackLevel {
        args.extend(["-i", AUDIO_STREAM, "-map", "0:v", "-map", "1:a"].map(String::from));
    } else {
        args.extend(["-map", "0:v", "-map", "0:a"].map(String::from));
    }
    args.extend(["-c:v", "copy"].map(String::from));
    if config.rotate {
        args.extend(["-metadata:s:v:0", "rotate=-90"].map(String::from));
    }
    if tier.needs_audio_reencode() {
        let bitrate = config.audio_bitrate.to_string();
        args.extend(["-c:a", "aac", "-b:a", bitrate.as_str()].map(String::from));
    } else {
        args.extend(["-c:a", "copy"].map(String::from));
    }
    args
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
