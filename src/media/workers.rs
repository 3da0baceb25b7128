use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::media::types::BackendEvent;

/// Events all encoder workers funnel into one relay channel, tagged with the
/// mux input stream they feed.
#[derive(Debug)]
pub enum WorkerEvent {
    Data { name: &'static str, data: Bytes },
    Error { name: &'static str, detail: String },
    Exited { name: &'static str },
}

/// Pumps one backend's chunk stream into the shared relay channel. The
/// backend closing its channel is the normal end of stream and surfaces as
/// `Exited`; exactly one `Exited` is sent per worker.
pub struct EncoderWorker {
    name: &'static str,
    cancel: CancellationToken,
}

impl EncoderWorker {
    pub fn spawn(
        name: &'static str,
        mut chunks: mpsc::Receiver<BackendEvent>,
        relay: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        break;
                    }
                    chunk = chunks.recv() => {
                        match chunk {
                            Some(BackendEvent::Data(data)) => {
                                if relay.send(WorkerEvent::Data { name, data }).await.is_err() {
                                    break;
                                }
                            }
                            Some(BackendEvent::Error(detail)) => {
                                log::error!("encoder worker {} backend error: {}", name, detail);
                                if relay.send(WorkerEvent::Error { name, detail }).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                break;
                            }
                        }
                    }
                }
            }
            log::info!("encoder worker {} finished", name);
            let _ = relay.send(WorkerEvent::Exited { name }).await;
        });
        Self { name, cancel }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EncoderWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
