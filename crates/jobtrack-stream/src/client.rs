use std::pin::Pin;

use futures::StreamExt as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::errors::{JobtrackError, StreamError};
use crate::frame::{FrameDecoder, Framing};
use crate::model::{ChatTurn, JobId, Phase};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Callbacks driven by one streaming run.
///
/// `on_event` calls preserve frame arrival order. Exactly one of `on_done` and
/// `on_error` fires for a run that is not cancelled, and neither fires for a
/// cancelled one.
pub trait StreamSink: Send + 'static {
    /// The server accepted the request and the body is about to be read.
    fn on_open(&mut self) {}
    /// One decoded, non-terminal payload.
    fn on_event(&mut self, payload: String);
    /// Terminal frame decoded or the body ended.
    fn on_done(&mut self);
    /// Connection or read failure.
    fn on_error(&mut self, error: StreamError);
}

/// Handle used to cancel a running stream.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Requests cancellation. Calling it again, or after the run finished, has no effect.
    pub fn abort(&self) {
        self.tx.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    /// True once `abort` was called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One in-flight stream.
#[derive(Debug)]
pub struct RunHandle {
    run_id: uuid::Uuid,
    abort: AbortHandle,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Id shared by every log line of this run.
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Returns a handle that can cancel the run.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Cancels the run.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// True once `abort` was called on this run.
    pub fn is_cancelled(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// True once the pump task has returned, whichever way it ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the pump task to return.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(run_id = %self.run_id, error = %e, "stream task ended abnormally");
        }
    }
}

/// Request that starts one run.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub method: reqwest::Method,
    /// Path below `/api`.
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub framing: Framing,
}

impl StreamRequest {
    /// `POST /api/pipeline/{job}/{phase}`.
    pub fn pipeline(job_id: &JobId, phase: Phase) -> Self {
        Self {
            method: reqwest::Method::POST,
            path: format!("pipeline/{job_id}/{}", phase.path_segment()),
            body: None,
            framing: Framing::Structured,
        }
    }

    /// `GET /api/pipeline/{job}/status`, the read-only status stream.
    pub fn status_watch(job_id: &JobId) -> Self {
        Self {
            method: reqwest::Method::GET,
            path: format!("pipeline/{job_id}/status"),
            body: None,
            framing: Framing::Structured,
        }
    }

    /// `POST /api/chat/{job}` with the new message and the prior turns.
    pub fn chat(job_id: &JobId, message: &str, history: &[ChatTurn]) -> Self {
        Self {
            method: reqwest::Method::POST,
            path: format!("chat/{job_id}"),
            body: Some(serde_json::json!({
                "message": message,
                "history": history,
            })),
            framing: Framing::chat(),
        }
    }
}

/// Opens streaming runs against the tracker backend.
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Result<Self, JobtrackError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| JobtrackError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts the run and returns its handle immediately.
    ///
    /// Must be called from within a tokio runtime. The connection is held by
    /// the spawned task and released whenever that task returns.
    pub fn open<S: StreamSink>(&self, request: StreamRequest, sink: S) -> RunHandle {
        self.open_with_id(uuid::Uuid::new_v4(), request, sink)
    }

    /// Same as [`StreamClient::open`] with a caller-chosen run id.
    pub fn open_with_id<S: StreamSink>(
        &self,
        run_id: uuid::Uuid,
        request: StreamRequest,
        sink: S,
    ) -> RunHandle {
        let (abort, abort_rx) = AbortHandle::new();
        let url = self.config.api_url(&request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        debug!(run_id = %run_id, method = %request.method, url = %url, "opening stream");
        let task = tokio::spawn(pump(run_id, builder, request.framing, sink, abort_rx));
        RunHandle {
            run_id,
            abort,
            task,
        }
    }
}

async fn pump<S: StreamSink>(
    run_id: uuid::Uuid,
    builder: reqwest::RequestBuilder,
    framing: Framing,
    mut sink: S,
    mut abort_rx: watch::Receiver<bool>,
) {
    let response = tokio::select! {
        biased;
        _ = cancelled(&mut abort_rx) => {
            debug!(run_id = %run_id, "stream cancelled before connection opened");
            return;
        }
        result = builder.send() => result,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            if !*abort_rx.borrow() {
                warn!(run_id = %run_id, error = %e, "stream connection failed");
                sink.on_error(StreamError::Connect(e.to_string()));
            }
            return;
        }
    };
    if *abort_rx.borrow() {
        return;
    }
    let status = response.status();
    if !status.is_success() {
        warn!(run_id = %run_id, status = status.as_u16(), "stream request rejected");
        sink.on_error(StreamError::Status {
            status: status.as_u16(),
        });
        return;
    }

    sink.on_open();
    let mut bytes_stream: ByteStream = Box::pin(response.bytes_stream());
    let mut decoder = FrameDecoder::new(framing);
    let mut seq = 0_u64;
    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut abort_rx) => {
                debug!(run_id = %run_id, frames = seq, "stream cancelled");
                return;
            }
            next = bytes_stream.next() => match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.push_chunk(&chunk) {
                        if *abort_rx.borrow() {
                            return;
                        }
                        if frame.is_terminal {
                            info!(run_id = %run_id, frames = seq, skipped = decoder.skipped(), "stream reached terminal frame");
                            sink.on_done();
                            return;
                        }
                        debug!(run_id = %run_id, seq, "stream frame");
                        sink.on_event(frame.payload);
                        seq = seq.saturating_add(1);
                    }
                }
                Some(Err(e)) => {
                    if *abort_rx.borrow() {
                        return;
                    }
                    warn!(run_id = %run_id, frames = seq, error = %e, "stream read failed");
                    sink.on_error(StreamError::Read(e.to_string()));
                    return;
                }
                None => {
                    info!(
                        run_id = %run_id,
                        frames = seq,
                        skipped = decoder.skipped(),
                        dropped_bytes = decoder.pending_bytes(),
                        "stream closed without terminal frame"
                    );
                    sink.on_done();
                    return;
                }
            }
        }
    }
}

/// Resolves once the abort flag is set. Never resolves if every handle was
/// dropped without aborting.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
