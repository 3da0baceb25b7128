// ============================================================================
// MuxEngine Tests
// ============================================================================

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::{MuxEngine, run_args};
use crate::protocol::{ContainerFlavor, ExitCode, MuxEvent, PublishMethod};
use crate::publisher::Publisher;
use crate::transcoder::{Transcoder, TranscoderEvent, TranscoderHandle};

// ------------------------------------------------------------------------
// Scripted peers
// ------------------------------------------------------------------------

/// Transcoder that records every call and hands the test a sender for
/// injecting process events.
struct MockTranscoder {
    log: Arc<Mutex<Vec<String>>>,
    spawned: Option<oneshot::Sender<mpsc::Sender<TranscoderEvent>>>,
    exit_on_drain: Option<i32>,
}

fn mock_transcoder(
    exit_on_drain: Option<i32>,
) -> (
    Box<MockTranscoder>,
    oneshot::Receiver<mpsc::Sender<TranscoderEvent>>,
    Arc<Mutex<Vec<String>>>,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = oneshot::channel();
    let transcoder = Box::new(MockTranscoder {
        log: Arc::clone(&log),
        spawned: Some(tx),
        exit_on_drain,
    });
    (transcoder, rx, log)
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn spawn(
        &mut self,
        _args: Vec<String>,
        inputs: Vec<String>,
    ) -> anyhow::Result<(Box<dyn TranscoderHandle>, mpsc::Receiver<TranscoderEvent>)> {
        self.log.lock().unwrap().push("spawn".to_string());
        let (ev_tx, ev_rx) = mpsc::channel(64);
        if let Some(spawned) = self.spawned.take() {
            let _ = spawned.send(ev_tx.clone());
        }
        let handle = MockHandle {
            log: Arc::clone(&self.log),
            events: ev_tx,
            inputs,
            ended: Vec::new(),
            exit_on_drain: self.exit_on_drain,
        };
        Ok((Box::new(handle), ev_rx))
    }
}

struct MockHandle {
    log: Arc<Mutex<Vec<String>>>,
    events: mpsc::Sender<TranscoderEvent>,
    inputs: Vec<String>,
    ended: Vec<String>,
    exit_on_drain: Option<i32>,
}

#[async_trait]
impl TranscoderHandle for MockHandle {
    async fn write(&mut self, name: &str, data: Bytes) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("write:{}:{}", name, data.len()));
        Ok(())
    }

    async fn end_input(&mut self, name: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("end:{}", name));
        if !self.ended.contains(&name.to_string()) {
            self.ended.push(name.to_string());
        }
        if self.ended.len() == self.inputs.len() {
            if let Some(status) = self.exit_on_drain {
                let _ = self.events.send(TranscoderEvent::Exited { status }).await;
            }
        }
        Ok(())
    }

    async fn kill(&mut self) {
        self.log.lock().unwrap().push("kill".to_string());
    }
}

/// Publisher that records uploads instead of doing HTTP.
#[derive(Clone)]
struct MockPublisher {
    destination: Arc<Mutex<Option<(String, PublishMethod)>>>,
    published: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

fn mock_publisher(
    fail: bool,
) -> (
    Box<MockPublisher>,
    Arc<Mutex<Option<(String, PublishMethod)>>>,
    Arc<Mutex<Vec<String>>>,
) {
    let destination = Arc::new(Mutex::new(None));
    let published = Arc::new(Mutex::new(Vec::new()));
    let publisher = Box::new(MockPublisher {
        destination: Arc::clone(&destination),
        published: Arc::clone(&published),
        fail,
    });
    (publisher, destination, published)
}

#[async_trait]
impl Publisher for MockPublisher {
    fn set_destination(&mut self, base_url: String, method: PublishMethod) {
        *self.destination.lock().unwrap() = Some((base_url, method));
    }

    fn has_destination(&self) -> bool {
        self.destination.lock().unwrap().is_some()
    }

    async fn publish(&mut self, name: &str, _data: Bytes) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("upload refused");
        }
        self.published.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

async fn next_event(rx: &mut mpsc::Receiver<MuxEvent>) -> MuxEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for engine event")
        .expect("engine event channel closed")
}

/// Waits until the call log contains the given entry (commands and injected
/// process events travel on separate channels, so ordering between them is
/// only observable through the log).
async fn wait_for_log(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if log.lock().unwrap().iter().any(|l| l == entry) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for log entry {:?}", entry);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_ready_fires_after_spawn() {
    let (transcoder, _spawned, log) = mock_transcoder(None);
    let (publisher, _, _) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    // nothing spawned until run is commanded
    assert!(log.lock().unwrap().is_empty());
    engine.stop();
}

#[tokio::test]
async fn test_base_url_handshake_gates_publishing() {
    let (transcoder, spawned, _log) = mock_transcoder(None);
    let (publisher, destination, published) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Hls, &[]),
        vec!["stream1".to_string()],
    );
    let proc_events = spawned.await.unwrap();

    // a segment completed before start-stream was answered: it must be
    // queued, not pushed
    proc_events
        .send(TranscoderEvent::SegmentReady {
            name: "output0.ts".to_string(),
            data: Bytes::from_static(b"early"),
        })
        .await
        .unwrap();
    proc_events
        .send(TranscoderEvent::StartStream)
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, MuxEvent::StartStream);
    assert!(published.lock().unwrap().is_empty());

    engine.base_url("https://ingest.example/live", PublishMethod::Post);
    assert_eq!(next_event(&mut events).await, MuxEvent::Sending);
    assert_eq!(
        destination.lock().unwrap().clone(),
        Some((
            "https://ingest.example/live".to_string(),
            PublishMethod::Post
        ))
    );
    assert_eq!(published.lock().unwrap().clone(), vec!["output0.ts"]);

    // later segments publish directly, sending fires only once
    proc_events
        .send(TranscoderEvent::SegmentReady {
            name: "output1.ts".to_string(),
            data: Bytes::from_static(b"late"),
        })
        .await
        .unwrap();
    proc_events
        .send(TranscoderEvent::Exited { status: 0 })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        MuxEvent::Exit {
            code: ExitCode::Code(0)
        }
    );
    assert_eq!(
        published.lock().unwrap().clone(),
        vec!["output0.ts", "output1.ts"]
    );
}

#[tokio::test]
async fn test_stream_data_reaches_named_input() {
    let (transcoder, spawned, log) = mock_transcoder(None);
    let (publisher, _, _) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Hls, &[]),
        vec!["stream1".to_string()],
    );
    let proc_events = spawned.await.unwrap();

    engine.stream_data("stream1", Bytes::from_static(b"chunk"));
    engine.stream_end("stream1");
    wait_for_log(&log, "end:stream1").await;

    proc_events
        .send(TranscoderEvent::Exited { status: 0 })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        MuxEvent::Exit {
            code: ExitCode::Code(0)
        }
    );

    let log = log.lock().unwrap().clone();
    assert_eq!(log, vec!["spawn", "write:stream1:5", "end:stream1"]);
}

#[tokio::test]
async fn test_data_before_run_is_flushed_after_spawn() {
    let (transcoder, spawned, log) = mock_transcoder(None);
    let (publisher, _, _) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    // the encoder started producing before the run was commanded; the head
    // of the stream must survive until the process is up
    engine.stream_data("stream1", Bytes::from_static(b"head"));
    engine.stream_data("stream1", Bytes::from_static(b"more!"));

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Hls, &[]),
        vec!["stream1".to_string()],
    );
    let _proc_events = spawned.await.unwrap();

    wait_for_log(&log, "write:stream1:5").await;
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["spawn", "write:stream1:4", "write:stream1:5"]
    );
    engine.stop();
}

#[tokio::test]
async fn test_forced_end_kills_and_synthesizes_exit() {
    let (transcoder, spawned, log) = mock_transcoder(None);
    let (publisher, _, _) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Hls, &[]),
        vec!["stream1".to_string()],
    );
    let _proc_events = spawned.await.unwrap();

    engine.end(true);
    assert_eq!(
        next_event(&mut events).await,
        MuxEvent::Exit {
            code: ExitCode::ForceEnd
        }
    );
    assert_eq!(log.lock().unwrap().clone(), vec!["spawn", "kill"]);

    // the peer is gone: late commands are dropped without reaching it
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.stream_data("stream1", Bytes::from_static(b"late"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(log.lock().unwrap().clone(), vec!["spawn", "kill"]);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_graceful_end_drains_all_inputs() {
    let (transcoder, spawned, log) = mock_transcoder(Some(0));
    let (publisher, _, _) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Dash, &[]),
        vec!["stream1".to_string(), "stream2".to_string()],
    );
    let _proc_events = spawned.await.unwrap();

    engine.end(false);
    assert_eq!(
        next_event(&mut events).await,
        MuxEvent::Exit {
            code: ExitCode::Code(0)
        }
    );
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["spawn", "end:stream1", "end:stream2"]
    );
}

#[tokio::test]
async fn test_fatal_is_not_terminal_on_its_own() {
    let (transcoder, spawned, _log) = mock_transcoder(None);
    let (publisher, _, _) = mock_publisher(false);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Hls, &[]),
        vec!["stream1".to_string()],
    );
    let proc_events = spawned.await.unwrap();

    proc_events
        .send(TranscoderEvent::Fatal {
            detail: "muxer blew up".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        MuxEvent::Error {
            detail: "muxer blew up".to_string()
        }
    );

    proc_events
        .send(TranscoderEvent::Exited { status: 1 })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        MuxEvent::Exit {
            code: ExitCode::Code(1)
        }
    );
}

#[tokio::test]
async fn test_publish_failure_surfaces_as_error() {
    let (transcoder, spawned, _log) = mock_transcoder(None);
    let (publisher, _, published) = mock_publisher(true);
    let (engine, mut events) = MuxEngine::spawn(transcoder, publisher);

    assert_eq!(next_event(&mut events).await, MuxEvent::Ready);
    engine.run(
        run_args(ContainerFlavor::Hls, &[]),
        vec!["stream1".to_string()],
    );
    let proc_events = spawned.await.unwrap();
    proc_events
        .send(TranscoderEvent::StartStream)
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, MuxEvent::StartStream);
    engine.base_url("https://ingest.example/live", PublishMethod::Post);

    proc_events
        .send(TranscoderEvent::SegmentReady {
            name: "output0.ts".to_string(),
            data: Bytes::from_static(b"seg"),
        })
        .await
        .unwrap();

    match next_event(&mut events).await {
        MuxEvent::Error { detail } => assert!(detail.contains("output0.ts")),
        other => panic!("Expected Error, got {:?}", other),
    }
    assert!(published.lock().unwrap().is_empty());
}

#[test]
fn test_run_args_hls() {
    let codec_args = vec!["-i".to_string(), "stream1".to_string()];
    let args = run_args(ContainerFlavor::Hls, &codec_args);
    assert_eq!(&args[..2], &["-seekable", "0"]);
    assert_eq!(&args[2..4], &["-i", "stream1"]);
    assert!(args.windows(2).any(|w| w == ["-f", "hls"]));
    assert!(args.windows(2).any(|w| w == ["-hls_time", "2"]));
    assert!(args.windows(2).any(|w| w == ["-hls_list_size", "2"]));
    assert!(args.windows(2).any(|w| w == ["-hls_segment_type", "mpegts"]));
    assert!(args.windows(2).any(|w| w == ["-hls_flags", "split_by_time"]));
    assert_eq!(args.last().unwrap(), "outbound/output.m3u8");
}

#[test]
fn test_run_args_dash() {
    let args = run_args(ContainerFlavor::Dash, &[]);
    assert!(args.windows(2).any(|w| w == ["-f", "dash"]));
    assert!(args.windows(2).any(|w| w == ["-seg_duration", "2"]));
    assert!(args.windows(2).any(|w| w == ["-window_size", "2"]));
    assert!(args.windows(2).any(|w| w == ["-streaming", "1"]));
    assert!(args.windows(2).any(|w| w == ["-dash_segment_type", "webm"]));
    assert_eq!(args.last().unwrap(), "outbound/output.mpd");
}
