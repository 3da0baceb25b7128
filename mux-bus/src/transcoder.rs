use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Notifications from a running transcoder process, delivered in send order
/// over a single channel per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    /// The process has opened its inputs and begun consuming.
    StartStream,
    /// A finished segment or manifest, named relative to the output
    /// directory, with its current contents.
    SegmentReady { name: String, data: Bytes },
    /// Process-level failure. Not terminal; termination is reported by
    /// `Exited`.
    Fatal { detail: String },
    /// The process aborted its run.
    Aborted { detail: String },
    /// The process exited with the given status.
    Exited { status: i32 },
}

/// A handle to a spawned transcoder process.
#[async_trait]
pub trait TranscoderHandle: Send {
    /// Push bytes into a named input. The buffer is consumed.
    async fn write(&mut self, name: &str, data: Bytes) -> anyhow::Result<()>;

    /// Signal end of data for a named input.
    async fn end_input(&mut self, name: &str) -> anyhow::Result<()>;

    /// Kill the process immediately. Idempotent.
    async fn kill(&mut self);
}

/// Spawns the out-of-process transcoder. The production implementation
/// launches ffmpeg; tests script an in-process peer.
#[async_trait]
pub trait Transcoder: Send + 'static {
    async fn spawn(
        &mut self,
        args: Vec<String>,
        inputs: Vec<String>,
    ) -> anyhow::Result<(Box<dyn TranscoderHandle>, mpsc::Receiver<TranscoderEvent>)>;
}
