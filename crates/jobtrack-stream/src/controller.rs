use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{RunHandle, StreamClient, StreamRequest, StreamSink};
use crate::config::ClientConfig;
use crate::errors::{JobtrackError, StoreError, StreamError};
use crate::model::{ChatRole, ChatTurn, JobId, Phase, PipelineEvent, SectionStatus, Slot};
use crate::reconciler::StatusOverlay;
use crate::store::{HttpJobStore, JobDetail, JobStore};

/// Lifecycle of one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RunState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// State published by a run to its readers.
pub trait RunSnapshot: Clone + Send + Sync + 'static {
    fn state(&self) -> RunState;
    fn set_state(&mut self, state: RunState);
    fn set_error(&mut self, error: StreamError);
}

/// Read-only view of a pipeline or status-watch run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub run_id: uuid::Uuid,
    pub job_id: JobId,
    pub slot: Slot,
    pub state: RunState,
    pub statuses: StatusOverlay,
    /// Transport failure that ended the run, if any.
    pub error: Option<StreamError>,
    /// Events applied so far.
    pub events: u64,
    /// Payloads that were valid frames but not valid events.
    pub skipped: u64,
}

impl PipelineSnapshot {
    /// Run-level failure message for display.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

impl RunSnapshot for PipelineSnapshot {
    fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
    }

    fn set_error(&mut self, error: StreamError) {
        self.error = Some(error);
    }
}

/// Read-only view of one chat exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub run_id: uuid::Uuid,
    pub job_id: JobId,
    pub state: RunState,
    /// Prior history, the new user turn, and the growing assistant turn.
    pub turns: Vec<ChatTurn>,
    pub error: Option<StreamError>,
}

impl ChatSnapshot {
    /// Content of the assistant turn being streamed.
    pub fn reply(&self) -> &str {
        match self.turns.last() {
            Some(turn) if turn.role == ChatRole::Assistant => &turn.content,
            _ => "",
        }
    }
}

impl RunSnapshot for ChatSnapshot {
    fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
    }

    fn set_error(&mut self, error: StreamError) {
        self.error = Some(error);
    }
}

trait Cancel: Send + Sync {
    fn run_id(&self) -> uuid::Uuid;
    fn cancel(&self);
}

struct RunInner<T: RunSnapshot> {
    slot: Slot,
    handle: RunHandle,
    tx: Arc<watch::Sender<T>>,
    registry: RunRegistry,
    poll_interval: Duration,
    poll_limit: u32,
}

impl<T: RunSnapshot> Cancel for RunInner<T> {
    fn run_id(&self) -> uuid::Uuid {
        self.handle.run_id()
    }

    fn cancel(&self) {
        if self.tx.borrow().state().is_terminal() {
            return;
        }
        self.handle.abort();
        if settle(&self.tx, RunState::Cancelled, None) {
            info!(run_id = %self.handle.run_id(), slot = %self.slot, "run cancelled");
        }
        self.registry.release(&self.slot, self.handle.run_id());
    }
}

/// Caller-facing handle of one run.
///
/// Cloning shares the same run. Terminal states are final; a new `start`
/// creates a new run.
pub struct Run<T: RunSnapshot> {
    inner: Arc<RunInner<T>>,
}

impl<T: RunSnapshot> Clone for Run<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Pipeline or status-watch run.
pub type PipelineRun = Run<PipelineSnapshot>;
/// Chat exchange.
pub type ChatRun = Run<ChatSnapshot>;

impl<T: RunSnapshot> Run<T> {
    /// Id of the underlying stream.
    pub fn run_id(&self) -> uuid::Uuid {
        self.inner.handle.run_id()
    }

    /// Slot this run occupies while live.
    pub fn slot(&self) -> &Slot {
        &self.inner.slot
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> T {
        self.inner.tx.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.inner.tx.borrow().state()
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.tx.subscribe()
    }

    /// Cancels the run. No effect once the run is terminal.
    pub fn stop(&self) {
        self.inner.cancel();
    }

    /// True once cancellation was requested for this run.
    pub fn is_cancelled(&self) -> bool {
        self.inner.handle.is_cancelled()
    }

    /// Waits until the run is terminal.
    ///
    /// The primary signal is the published state. A bounded interval check on
    /// the stream task backs it up for streams that end without any callback;
    /// the timer is dropped as soon as the primary signal reports a terminal
    /// state.
    pub async fn settled(&self) -> RunState {
        let mut rx = self.inner.tx.subscribe();
        let period = self.inner.poll_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0_u32;
        loop {
            let state = rx.borrow_and_update().state();
            if state.is_terminal() {
                return state;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.state();
                    }
                }
                _ = ticker.tick(), if ticks < self.inner.poll_limit => {
                    ticks += 1;
                    if self.inner.handle.is_finished() {
                        self.finish_orphaned();
                    }
                }
            }
        }
    }

    fn finish_orphaned(&self) {
        let (state, error) = if self.inner.handle.is_cancelled() {
            (RunState::Cancelled, None)
        } else {
            (
                RunState::Failed,
                Some(StreamError::Read(
                    "stream task ended without a terminal signal".into(),
                )),
            )
        };
        if settle(&self.inner.tx, state, error) {
            warn!(run_id = %self.run_id(), slot = %self.inner.slot, ?state, "settled run from fallback check");
        }
        self.inner
            .registry
            .release(&self.inner.slot, self.inner.handle.run_id());
    }
}

/// Moves a run into a terminal state unless it already is terminal.
fn settle<T: RunSnapshot>(
    tx: &watch::Sender<T>,
    state: RunState,
    error: Option<StreamError>,
) -> bool {
    tx.send_if_modified(|snapshot| {
        if snapshot.state().is_terminal() {
            return false;
        }
        snapshot.set_state(state);
        if let Some(error) = error {
            snapshot.set_error(error);
        }
        true
    })
}

fn mark_streaming<T: RunSnapshot>(tx: &watch::Sender<T>) {
    tx.send_if_modified(|snapshot| {
        if snapshot.state() != RunState::Starting {
            return false;
        }
        snapshot.set_state(RunState::Streaming);
        true
    });
}

/// Live runs keyed by slot, at most one per slot.
#[derive(Clone, Default)]
pub struct RunRegistry {
    slots: Arc<DashMap<Slot, Arc<dyn Cancel>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the live run in `slot`. Returns false if the slot was empty.
    pub fn stop(&self, slot: &Slot) -> bool {
        match self.slots.remove(slot) {
            Some((_, run)) => {
                run.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, slot: &Slot) -> bool {
        self.slots.contains_key(slot)
    }

    pub fn active_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    fn insert(&self, slot: Slot, run: Arc<dyn Cancel>) {
        if let Some(previous) = self.slots.insert(slot.clone(), run) {
            warn!(slot = %slot, run_id = %previous.run_id(), "slot was taken while starting; cancelling");
            previous.cancel();
        }
    }

    /// Removes the entry for `slot` only if it still belongs to `run_id`.
    fn release(&self, slot: &Slot, run_id: uuid::Uuid) {
        self.slots.remove_if(slot, |_, run| run.run_id() == run_id);
    }
}

struct SlotRelease {
    registry: RunRegistry,
    slot: Slot,
    run_id: uuid::Uuid,
}

impl SlotRelease {
    fn release(&self) {
        self.registry.release(&self.slot, self.run_id);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelinePayload {
    /// One `PipelineEvent` per frame.
    Events,
    /// One key to status map per frame.
    StatusMaps,
}

struct PipelineSink {
    tx: Arc<watch::Sender<PipelineSnapshot>>,
    payload: PipelinePayload,
    release: SlotRelease,
}

impl StreamSink for PipelineSink {
    fn on_open(&mut self) {
        mark_streaming(&self.tx);
    }

    fn on_event(&mut self, payload: String) {
        let update = match self.payload {
            PipelinePayload::Events => serde_json::from_str::<PipelineEvent>(&payload)
                .map(|event| Overlay::Event(Box::new(event))),
            PipelinePayload::StatusMaps => {
                serde_json::from_str::<BTreeMap<String, SectionStatus>>(&payload).map(Overlay::Map)
            }
        };
        self.tx.send_if_modified(|snapshot| {
            if snapshot.state.is_terminal() {
                return false;
            }
            match update {
                Ok(Overlay::Event(event)) => {
                    debug!(run_id = %snapshot.run_id, key = %event.section_key, status = %event.status, "section status");
                    snapshot.statuses.apply(*event);
                    snapshot.events += 1;
                }
                Ok(Overlay::Map(map)) => {
                    snapshot.statuses.apply_snapshot(map);
                    snapshot.events += 1;
                }
                Err(e) => {
                    debug!(run_id = %snapshot.run_id, error = %e, "skipping undecodable pipeline payload");
                    snapshot.skipped += 1;
                }
            }
            true
        });
    }

    fn on_done(&mut self) {
        if settle(&self.tx, RunState::Completed, None) {
            let snapshot = self.tx.borrow();
            info!(run_id = %snapshot.run_id, slot = %snapshot.slot, events = snapshot.events, "pipeline run completed");
        }
        self.release.release();
    }

    fn on_error(&mut self, error: StreamError) {
        warn!(run_id = %self.release.run_id, slot = %self.release.slot, error = %error, "pipeline run failed");
        settle(&self.tx, RunState::Failed, Some(error));
        self.release.release();
    }
}

enum Overlay {
    Event(Box<PipelineEvent>),
    Map(BTreeMap<String, SectionStatus>),
}

struct ChatSink {
    tx: Arc<watch::Sender<ChatSnapshot>>,
    release: SlotRelease,
}

impl StreamSink for ChatSink {
    fn on_open(&mut self) {
        mark_streaming(&self.tx);
    }

    fn on_event(&mut self, payload: String) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.state.is_terminal() {
                return false;
            }
            match snapshot.turns.last_mut() {
                Some(turn) if turn.role == ChatRole::Assistant => {
                    turn.content.push_str(&payload);
                    true
                }
                _ => false,
            }
        });
    }

    fn on_done(&mut self) {
        if settle(&self.tx, RunState::Completed, None) {
            let snapshot = self.tx.borrow();
            info!(run_id = %snapshot.run_id, reply_len = snapshot.reply().len(), "chat reply completed");
        }
        self.release.release();
    }

    fn on_error(&mut self, error: StreamError) {
        warn!(run_id = %self.release.run_id, slot = %self.release.slot, error = %error, "chat reply failed");
        settle(&self.tx, RunState::Failed, Some(error));
        self.release.release();
    }
}

/// Owns run lifecycles and the registry of live slots.
///
/// This is the only component callers need to drive runs.
#[derive(Clone)]
pub struct RunController {
    client: StreamClient,
    store: Arc<dyn JobStore>,
    registry: RunRegistry,
}

impl RunController {
    pub fn new(client: StreamClient, store: Arc<dyn JobStore>) -> Self {
        Self {
            client,
            store,
            registry: RunRegistry::new(),
        }
    }

    /// Controller talking to the REST backend described by `config`.
    pub fn from_config(config: ClientConfig) -> Result<Self, JobtrackError> {
        let store = HttpJobStore::new(config.clone())?;
        let client = StreamClient::new(config)?;
        Ok(Self::new(client, Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Starts a pipeline phase, cancelling any live run for the same job and phase.
    pub fn start_pipeline(&self, job_id: &JobId, phase: Phase) -> PipelineRun {
        let slot = Slot::pipeline(job_id.clone(), phase);
        self.launch_pipeline(
            slot,
            job_id,
            StreamRequest::pipeline(job_id, phase),
            PipelinePayload::Events,
        )
    }

    /// Follows the read-only status stream of a job.
    pub fn watch_status(&self, job_id: &JobId) -> PipelineRun {
        let slot = Slot::StatusWatch {
            job_id: job_id.clone(),
        };
        self.launch_pipeline(
            slot,
            job_id,
            StreamRequest::status_watch(job_id),
            PipelinePayload::StatusMaps,
        )
    }

    /// Starts one chat exchange in `widget`, cancelling the widget's live exchange.
    ///
    /// `history` holds the turns before `message`; the growing assistant turn
    /// is never part of the request.
    pub fn start_chat(
        &self,
        widget: &str,
        job_id: &JobId,
        message: &str,
        history: &[ChatTurn],
    ) -> ChatRun {
        let slot = Slot::chat(widget);
        self.registry.stop(&slot);
        let run_id = uuid::Uuid::new_v4();
        let mut turns = history.to_vec();
        turns.push(ChatTurn::user(message));
        turns.push(ChatTurn::assistant(String::new()));
        let (tx, _) = watch::channel(ChatSnapshot {
            run_id,
            job_id: job_id.clone(),
            state: RunState::Starting,
            turns,
            error: None,
        });
        let tx = Arc::new(tx);
        let sink = ChatSink {
            tx: tx.clone(),
            release: self.slot_release(&slot, run_id),
        };
        let handle =
            self.client
                .open_with_id(run_id, StreamRequest::chat(job_id, message, history), sink);
        info!(run_id = %run_id, slot = %slot, history = history.len(), "chat exchange started");
        self.register(slot, handle, tx)
    }

    /// Cancels the live run in `slot`. Returns false if nothing was running.
    pub fn stop(&self, slot: &Slot) -> bool {
        self.registry.stop(slot)
    }

    pub fn active_slots(&self) -> Vec<Slot> {
        self.registry.active_slots()
    }

    /// Waits for `run` to settle and, if it completed, re-fetches the job once.
    ///
    /// Returns `None` for cancelled or failed runs; persisted state is left
    /// at its last known value in that case.
    pub async fn refresh_after(&self, run: &PipelineRun) -> Result<Option<JobDetail>, StoreError> {
        let state = run.settled().await;
        if state != RunState::Completed {
            debug!(run_id = %run.run_id(), ?state, "skipping refresh for unsuccessful run");
            return Ok(None);
        }
        let job_id = run.snapshot().job_id;
        let job = self.store.fetch_job(&job_id).await?;
        Ok(Some(job))
    }

    fn launch_pipeline(
        &self,
        slot: Slot,
        job_id: &JobId,
        request: StreamRequest,
        payload: PipelinePayload,
    ) -> PipelineRun {
        self.registry.stop(&slot);
        let run_id = uuid::Uuid::new_v4();
        let (tx, _) = watch::channel(PipelineSnapshot {
            run_id,
            job_id: job_id.clone(),
            slot: slot.clone(),
            state: RunState::Starting,
            statuses: StatusOverlay::new(),
            error: None,
            events: 0,
            skipped: 0,
        });
        let tx = Arc::new(tx);
        let sink = PipelineSink {
            tx: tx.clone(),
            payload,
            release: self.slot_release(&slot, run_id),
        };
        let handle = self.client.open_with_id(run_id, request, sink);
        info!(run_id = %run_id, slot = %slot, "pipeline run started");
        self.register(slot, handle, tx)
    }

    fn slot_release(&self, slot: &Slot, run_id: uuid::Uuid) -> SlotRelease {
        SlotRelease {
            registry: self.registry.clone(),
            slot: slot.clone(),
            run_id,
        }
    }

    fn register<T: RunSnapshot>(
        &self,
        slot: Slot,
        handle: RunHandle,
        tx: Arc<watch::Sender<T>>,
    ) -> Run<T> {
        let config = self.client.config();
        let inner = Arc::new(RunInner {
            slot: slot.clone(),
            handle,
            tx,
            registry: self.registry.clone(),
            poll_interval: config.fallback_poll_interval,
            poll_limit: config.fallback_poll_limit,
        });
        let run_id = inner.handle.run_id();
        self.registry.insert(slot.clone(), inner.clone());
        // The stream may already have settled before the entry existed.
        if inner.tx.borrow().state().is_terminal() {
            self.registry.release(&slot, run_id);
        }
        Run { inner }
    }
}

/// Conversation held by one chat widget.
pub struct ChatSession {
    widget: String,
    job_id: JobId,
    history: Vec<ChatTurn>,
    current: Option<ChatRun>,
}

impl ChatSession {
    pub fn new(widget: impl Into<String>, job_id: impl Into<JobId>) -> Self {
        Self {
            widget: widget.into(),
            job_id: job_id.into(),
            history: Vec::new(),
            current: None,
        }
    }

    /// Sends `message`, superseding any exchange still streaming.
    pub fn send(
        &mut self,
        controller: &RunController,
        message: &str,
    ) -> Result<ChatRun, JobtrackError> {
        let text = message.trim();
        if text.is_empty() {
            return Err(JobtrackError::Validation(
                "chat message must not be empty".into(),
            ));
        }
        if let Some(previous) = self.current.take() {
            previous.stop();
            self.history = settled_turns(previous.snapshot().turns);
        }
        let run = controller.start_chat(&self.widget, &self.job_id, text, &self.history);
        self.current = Some(run.clone());
        Ok(run)
    }

    /// Stops the live exchange, keeping whatever reply arrived so far.
    pub fn stop(&self) {
        if let Some(run) = &self.current {
            run.stop();
        }
    }

    /// All turns including the latest exchange.
    pub fn turns(&self) -> Vec<ChatTurn> {
        match &self.current {
            Some(run) => run.snapshot().turns,
            None => self.history.clone(),
        }
    }

    pub fn current(&self) -> Option<&ChatRun> {
        self.current.as_ref()
    }
}

/// Drops a trailing assistant turn that never received content.
fn settled_turns(mut turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
    if let Some(last) = turns.last()
        && last.role == ChatRole::Assistant
        && last.content.is_empty()
    {
        turns.pop();
    }
    turns
}
