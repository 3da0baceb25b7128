use bytes::Bytes;

/// Commands sent from the orchestrator to a mux engine peer.
///
/// `StreamData` and `StreamEnd` are fire-and-forget: no acknowledgement is
/// sent back and no backpressure is applied beyond the channel capacity.
#[derive(Debug)]
pub enum MuxCommand {
    /// Start the muxing run with the full transcoder argument vector and the
    /// named virtual inputs the orchestrator will feed.
    Run {
        args: Vec<String>,
        inputs: Vec<String>,
    },
    /// Elementary-stream bytes for a named input. Ownership of the buffer
    /// moves to the engine; the sender must not reuse it.
    StreamData { name: String, data: Bytes },
    /// No more data will arrive for the named input.
    StreamEnd { name: String },
    /// Destination for finished segments. Sent only in response to
    /// `StartStream` so the destination is never contacted before the
    /// transcoder confirms it is consuming input.
    BaseUrl { url: String, method: PublishMethod },
    /// Terminate the run. `force` kills the transcoder instead of draining.
    End { force: bool },
}

/// Events emitted by a mux engine peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// The peer is ready to accept `Run`. Always delivered asynchronously
    /// after spawn, never during construction.
    Ready,
    /// The transcoder has begun consuming input. The orchestrator replies
    /// with `BaseUrl`.
    StartStream,
    /// The first segment was successfully published.
    Sending,
    /// Non-terminal failure report. Always followed by an `Exit` when the
    /// failure terminates the run.
    Error { detail: String },
    /// The transcoder aborted. Like `Error`, this is not terminal by itself.
    Abort { detail: String },
    /// Terminal. Emitted exactly once per engine lifetime.
    Exit { code: ExitCode },
}

/// Terminal status of an engine run: the transcoder's own exit status, or
/// the sentinel for a locally forced teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Code(i32),
    ForceEnd,
}

impl ExitCode {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitCode::Code(0))
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Code(code) => write!(f, "{}", code),
            ExitCode::ForceEnd => write!(f, "force-end"),
        }
    }
}

/// HTTP method used for segment uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMethod {
    Post,
    Put,
}

/// Segmented output container flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFlavor {
    Hls,
    Dash,
}

impl ContainerFlavor {
    /// HLS segments are POSTed, DASH segments are PUT.
    pub fn publish_method(&self) -> PublishMethod {
        match self {
            ContainerFlavor::Hls => PublishMethod::Post,
            ContainerFlavor::Dash => PublishMethod::Put,
        }
    }

    pub fn manifest_name(&self) -> &'static str {
        match self {
            ContainerFlavor::Hls => "output.m3u8",
            ContainerFlavor::Dash => "output.mpd",
        }
    }
}
