use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream;
use jobtrack_stream::{
    ChatRole, ChatSession, ClientConfig, HttpJobStore, JobId, JobStore, Phase, Run, RunController,
    RunSnapshot, RunState, SectionStatus, Slot, StoreError, StreamError,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Chunk = Result<Bytes, std::io::Error>;

enum Scripted {
    Status(StatusCode),
    Body(mpsc::UnboundedReceiver<Chunk>),
}

#[derive(Clone, Default)]
struct MockState {
    scripts: Arc<Mutex<VecDeque<Scripted>>>,
    stream_requests: Arc<Mutex<Vec<(String, Option<serde_json::Value>)>>>,
    job_fetches: Arc<AtomicUsize>,
}

impl MockState {
    fn script_status(&self, status: StatusCode) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(Scripted::Status(status));
    }

    fn script_body(&self) -> mpsc::UnboundedSender<Chunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(Scripted::Body(rx));
        tx
    }

    fn requests(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.stream_requests.lock().expect("requests lock").clone()
    }
}

fn serve_script(state: &MockState, path: String, body: Bytes) -> Response {
    let json = serde_json::from_slice(&body).ok();
    state
        .stream_requests
        .lock()
        .expect("requests lock")
        .push((path, json));
    let next = state.scripts.lock().expect("scripts lock").pop_front();
    match next {
        Some(Scripted::Status(status)) => (status, "scripted failure").into_response(),
        Some(Scripted::Body(rx)) => {
            let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            }));
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/event-stream")],
                body,
            )
                .into_response()
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "no script").into_response(),
    }
}

async fn pipeline(
    State(state): State<MockState>,
    Path((job_id, phase)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    serve_script(&state, format!("POST /api/pipeline/{job_id}/{phase}"), body)
}

async fn pipeline_status(State(state): State<MockState>, Path(job_id): Path<String>) -> Response {
    serve_script(
        &state,
        format!("GET /api/pipeline/{job_id}/status"),
        Bytes::new(),
    )
}

async fn chat(State(state): State<MockState>, Path(job_id): Path<String>, body: Bytes) -> Response {
    serve_script(&state, format!("POST /api/chat/{job_id}"), body)
}

async fn job(State(state): State<MockState>, Path(job_id): Path<String>) -> Response {
    if job_id != "job-1" {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"detail": "Job not found"})),
        )
            .into_response();
    }
    state.job_fetches.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({
        "id": "job-1",
        "company": "Acme",
        "role": "Staff Engineer",
        "pipeline_stage": "analyzed",
        "extraction_status": "complete",
        "sections": [
            {"id": "s1", "job": "job-1", "section_key": "gate_check", "phase": "analysis",
             "status": "complete", "content_md": "Passes", "is_locked": false}
        ]
    }))
    .into_response()
}

async fn section_definitions() -> Json<serde_json::Value> {
    Json(serde_json::json!([
        {"key": "final_verdict", "label": "Final Verdict", "order": 1, "depends_on": ["gate_check"], "phase": "analysis"},
        {"key": "gate_check", "label": "Gate Check", "order": 7, "depends_on": [], "phase": "analysis"},
        {"key": "cl_intro", "label": "Introduction", "order": 14, "depends_on": [], "phase": "cover_letter"}
    ]))
}

async fn spawn_mock_server() -> (String, MockState, tokio::task::JoinHandle<()>) {
    let state = MockState::default();
    let app = Router::new()
        .route("/api/pipeline/{job_id}/status", get(pipeline_status))
        .route("/api/pipeline/{job_id}/{phase}", post(pipeline))
        .route("/api/chat/{job_id}", post(chat))
        .route("/api/jobs/{job_id}", get(job))
        .route("/api/section-definitions", get(section_definitions))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let address: SocketAddr = listener.local_addr().expect("mock listener local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("run mock server");
    });
    (format!("http://{address}"), state, handle)
}

fn controller(base_url: &str) -> RunController {
    RunController::from_config(
        ClientConfig::new(base_url).fallback_poll(Duration::from_millis(20), 100),
    )
    .expect("controller")
}

fn send(tx: &mpsc::UnboundedSender<Chunk>, text: &str) {
    let _ = tx.send(Ok(Bytes::from(text.to_owned())));
}

async fn wait_for<T: RunSnapshot>(run: &Run<T>, pred: impl Fn(&T) -> bool) -> T {
    let mut rx = run.subscribe();
    timeout(TEST_TIMEOUT, async move {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&*snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("run sender alive");
        }
    })
    .await
    .expect("condition timeout")
}

async fn settled<T: RunSnapshot>(run: &Run<T>) -> RunState {
    timeout(TEST_TIMEOUT, run.settled())
        .await
        .expect("settle timeout")
}

const SCENARIO_A: &str = "data: {\"sectionKey\":\"gate_check\",\"status\":\"running\"}\n\ndata: {\"sectionKey\":\"gate_check\",\"status\":\"complete\"}\n\ndata: {\"done\":true}\n\n";

#[tokio::test]
async fn pipeline_run_completes_and_refreshes_once() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(&tx, SCENARIO_A);

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    let refreshed = timeout(TEST_TIMEOUT, controller.refresh_after(&run))
        .await
        .expect("refresh timeout")
        .expect("refresh")
        .expect("completed run refreshes");

    let snapshot = run.snapshot();
    assert_eq!(snapshot.state, RunState::Completed);
    assert_eq!(snapshot.statuses.len(), 1);
    assert_eq!(
        snapshot.statuses.get("gate_check"),
        Some(SectionStatus::Complete)
    );
    assert!(snapshot.error.is_none());
    assert_eq!(refreshed.persisted_status("gate_check"), Some(SectionStatus::Complete));
    assert_eq!(state.job_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        state.requests()[0].0,
        "POST /api/pipeline/job-1/analyze".to_string()
    );
    assert!(controller.active_slots().is_empty());
    server.abort();
}

#[tokio::test]
async fn frames_split_across_network_chunks_decode_identically() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::CoverLetter);

    wait_for(&run, |s| s.state == RunState::Streaming).await;
    let bytes = SCENARIO_A.as_bytes();
    for chunk in bytes.chunks(7) {
        let _ = tx.send(Ok(Bytes::copy_from_slice(chunk)));
        tokio::task::yield_now().await;
    }

    assert_eq!(settled(&run).await, RunState::Completed);
    let snapshot = run.snapshot();
    assert_eq!(snapshot.events, 2);
    assert_eq!(
        snapshot.statuses.get("gate_check"),
        Some(SectionStatus::Complete)
    );
    server.abort();
}

#[tokio::test]
async fn frames_after_terminal_sentinel_are_not_dispatched() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(
        &tx,
        "data: {\"section_key\":\"a\",\"status\":\"running\"}\n\ndata: {\"done\":true}\n\ndata: {\"section_key\":\"b\",\"status\":\"running\"}\n\n",
    );

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    assert_eq!(settled(&run).await, RunState::Completed);
    let snapshot = run.snapshot();
    assert_eq!(snapshot.events, 1);
    assert_eq!(snapshot.statuses.get("b"), None);
    server.abort();
}

#[tokio::test]
async fn malformed_line_between_frames_is_tolerated() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(
        &tx,
        "data: {\"section_key\":\"a\",\"status\":\"running\"}\n\nnot a data line\n\ndata: {\"section_key\":\"a\",\"status\":\"complete\"}\n\n",
    );
    drop(tx);

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    assert_eq!(settled(&run).await, RunState::Completed);
    let snapshot = run.snapshot();
    assert_eq!(snapshot.events, 2);
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.statuses.get("a"), Some(SectionStatus::Complete));
    server.abort();
}

#[tokio::test]
async fn chat_reply_accumulates_until_done_sentinel() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(&tx, "data: Hel\n\ndata: lo!\n\ndata: [DONE]\n\n");

    let controller = controller(&base_url);
    let mut session = ChatSession::new("role-detail", "job-1");
    let run = session.send(&controller, "  Is this role a fit?  ").expect("send");
    assert_eq!(settled(&run).await, RunState::Completed);

    let snapshot = run.snapshot();
    assert_eq!(snapshot.reply(), "Hello!");
    assert_eq!(snapshot.turns.len(), 2);
    assert_eq!(snapshot.turns[0].content, "Is this role a fit?");

    let (path, body) = state.requests()[0].clone();
    assert_eq!(path, "POST /api/chat/job-1");
    let body = body.expect("chat body");
    assert_eq!(body["message"], "Is this role a fit?");
    assert_eq!(body["history"], serde_json::json!([]));

    let tx = state.script_body();
    send(&tx, "data: Sure.\n\ndata: [DONE]\n\n");
    let second = session.send(&controller, "Summarize it").expect("send");
    assert_eq!(settled(&second).await, RunState::Completed);
    let body = state.requests()[1].1.clone().expect("chat body");
    assert_eq!(
        body["history"],
        serde_json::json!([
            {"role": "user", "content": "Is this role a fit?"},
            {"role": "assistant", "content": "Hello!"}
        ])
    );
    assert_eq!(session.turns().len(), 4);
    server.abort();
}

#[tokio::test]
async fn failed_exchange_leaves_only_the_user_turn_in_history() {
    let (base_url, state, server) = spawn_mock_server().await;
    state.script_status(StatusCode::INTERNAL_SERVER_ERROR);

    let controller = controller(&base_url);
    let mut session = ChatSession::new("role-detail", "job-1");
    let failed = session.send(&controller, "First question").expect("send");
    assert_eq!(settled(&failed).await, RunState::Failed);
    assert_eq!(failed.snapshot().reply(), "");

    let tx = state.script_body();
    send(&tx, "data: Answer.\n\ndata: [DONE]\n\n");
    let retry = session.send(&controller, "Second question").expect("send");
    assert_eq!(settled(&retry).await, RunState::Completed);

    let body = state.requests()[1].1.clone().expect("chat body");
    assert_eq!(body["message"], "Second question");
    assert_eq!(
        body["history"],
        serde_json::json!([{"role": "user", "content": "First question"}])
    );
    let roles: Vec<_> = session.turns().into_iter().map(|turn| turn.role).collect();
    assert_eq!(
        roles,
        vec![ChatRole::User, ChatRole::User, ChatRole::Assistant]
    );
    server.abort();
}

#[tokio::test]
async fn blank_chat_message_is_rejected() {
    let (base_url, _state, server) = spawn_mock_server().await;
    let controller = controller(&base_url);
    let mut session = ChatSession::new("w", "job-1");
    assert!(session.send(&controller, "   ").is_err());
    assert!(session.current().is_none());
    server.abort();
}

#[tokio::test]
async fn server_error_fails_the_run_before_any_frame() {
    let (base_url, state, server) = spawn_mock_server().await;
    state.script_status(StatusCode::INTERNAL_SERVER_ERROR);

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    let refreshed = timeout(TEST_TIMEOUT, controller.refresh_after(&run))
        .await
        .expect("refresh timeout")
        .expect("refresh");

    assert!(refreshed.is_none());
    let snapshot = run.snapshot();
    assert_eq!(snapshot.state, RunState::Failed);
    assert!(snapshot.statuses.is_empty());
    assert_eq!(snapshot.error, Some(StreamError::Status { status: 500 }));
    assert_eq!(
        snapshot.error_message().as_deref(),
        Some("stream request failed with status 500")
    );
    assert_eq!(state.job_fetches.load(Ordering::SeqCst), 0);
    server.abort();
}

#[tokio::test]
async fn unreachable_backend_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr");
    drop(listener);

    let controller = controller(&format!("http://{address}"));
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    assert_eq!(settled(&run).await, RunState::Failed);
    assert!(matches!(run.snapshot().error, Some(StreamError::Connect(_))));
}

#[tokio::test]
async fn restarting_a_slot_cancels_the_previous_run() {
    let (base_url, state, server) = spawn_mock_server().await;
    let first_tx = state.script_body();
    let second_tx = state.script_body();

    let controller = controller(&base_url);
    let job = JobId::new("job-1");
    let first = controller.start_pipeline(&job, Phase::Analyze);
    wait_for(&first, |s| s.state == RunState::Streaming).await;

    let second = controller.start_pipeline(&job, Phase::Analyze);
    assert!(first.is_cancelled());
    assert_eq!(first.state(), RunState::Cancelled);
    assert_eq!(
        controller.active_slots(),
        vec![Slot::pipeline("job-1", Phase::Analyze)]
    );

    send(
        &first_tx,
        "data: {\"section_key\":\"stale\",\"status\":\"running\"}\n\n",
    );
    send(
        &second_tx,
        "data: {\"section_key\":\"fresh\",\"status\":\"running\"}\n\ndata: {\"section_key\":\"fresh\",\"status\":\"complete\"}\n\ndata: {\"done\":true}\n\n",
    );

    assert_eq!(settled(&second).await, RunState::Completed);
    let snapshot = second.snapshot();
    assert_eq!(
        snapshot.statuses.to_map().into_keys().collect::<Vec<_>>(),
        vec!["fresh".to_string()]
    );
    assert!(first.snapshot().statuses.is_empty());
    assert_eq!(first.state(), RunState::Cancelled);
    assert!(controller.active_slots().is_empty());
    server.abort();
}

#[tokio::test]
async fn other_phase_of_the_same_job_is_not_superseded() {
    let (base_url, state, server) = spawn_mock_server().await;
    let _analyze_tx = state.script_body();
    let _cover_tx = state.script_body();

    let controller = controller(&base_url);
    let job = JobId::new("job-1");
    let analyze = controller.start_pipeline(&job, Phase::Analyze);
    wait_for(&analyze, |s| s.state == RunState::Streaming).await;
    let cover = controller.start_pipeline(&job, Phase::CoverLetter);
    wait_for(&cover, |s| s.state == RunState::Streaming).await;

    assert!(!analyze.is_cancelled());
    assert_eq!(controller.active_slots().len(), 2);
    assert!(controller.stop(&Slot::pipeline("job-1", Phase::Analyze)));
    assert_eq!(analyze.state(), RunState::Cancelled);
    assert_eq!(cover.state(), RunState::Streaming);
    cover.stop();
    assert!(controller.active_slots().is_empty());
    server.abort();
}

#[tokio::test]
async fn cancellation_suppresses_errors_and_further_events() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    send(&tx, "data: {\"section_key\":\"a\",\"status\":\"running\"}\n\n");
    wait_for(&run, |s| s.events == 1).await;

    run.stop();
    run.stop();
    send(&tx, "data: {\"section_key\":\"a\",\"status\":\"complete\"}\n\n");
    let _ = tx.send(Err(std::io::Error::other("connection torn down")));

    assert_eq!(settled(&run).await, RunState::Cancelled);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = run.snapshot();
    assert_eq!(snapshot.state, RunState::Cancelled);
    assert_eq!(snapshot.events, 1);
    assert_eq!(snapshot.statuses.get("a"), Some(SectionStatus::Running));
    assert!(snapshot.error.is_none());
    assert!(
        controller
            .refresh_after(&run)
            .await
            .expect("refresh")
            .is_none()
    );
    server.abort();
}

#[tokio::test]
async fn stopping_a_completed_run_changes_nothing() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(&tx, "data: {\"done\":true}\n\n");

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    assert_eq!(settled(&run).await, RunState::Completed);
    run.stop();
    assert_eq!(run.state(), RunState::Completed);
    assert!(!run.is_cancelled());
    server.abort();
}

#[tokio::test]
async fn mid_stream_read_failure_keeps_partial_statuses() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    send(
        &tx,
        "data: {\"section_key\":\"gate_check\",\"status\":\"complete\"}\n\n",
    );
    wait_for(&run, |s| s.events == 1).await;
    let _ = tx.send(Err(std::io::Error::other("backend crashed")));

    assert_eq!(settled(&run).await, RunState::Failed);
    let snapshot = run.snapshot();
    assert!(matches!(snapshot.error, Some(StreamError::Read(_))));
    assert_eq!(
        snapshot.statuses.get("gate_check"),
        Some(SectionStatus::Complete)
    );
    server.abort();
}

#[tokio::test]
async fn failed_section_event_does_not_fail_the_run() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(
        &tx,
        "data: {\"section_key\":\"glassdoor_research\",\"status\":\"failed\",\"error_message\":\"search quota exceeded\"}\n\ndata: {\"section_key\":\"final_verdict\",\"status\":\"complete\"}\n\ndata: {\"done\":true}\n\n",
    );

    let controller = controller(&base_url);
    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    assert_eq!(settled(&run).await, RunState::Completed);
    let snapshot = run.snapshot();
    assert!(snapshot.error.is_none());
    assert_eq!(
        snapshot
            .statuses
            .detail("glassdoor_research")
            .and_then(|d| d.error_message.as_deref()),
        Some("search quota exceeded")
    );
    server.abort();
}

#[tokio::test]
async fn status_watch_applies_whole_maps() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();
    send(
        &tx,
        "data: {\"gate_check\":\"running\"}\n\ndata: {\"gate_check\":\"complete\",\"company_research\":\"complete\"}\n\ndata: {\"done\": true}\n\n",
    );

    let controller = controller(&base_url);
    let run = controller.watch_status(&JobId::new("job-1"));
    assert_eq!(settled(&run).await, RunState::Completed);
    let snapshot = run.snapshot();
    assert_eq!(snapshot.events, 2);
    assert!(!snapshot.statuses.any_active());
    assert_eq!(
        state.requests()[0].0,
        "GET /api/pipeline/job-1/status".to_string()
    );
    server.abort();
}

#[tokio::test]
async fn http_store_reads_catalogue_and_reports_missing_jobs() {
    let (base_url, _state, server) = spawn_mock_server().await;
    let store = HttpJobStore::new(ClientConfig::new(&base_url)).expect("store");

    let catalogue = store.fetch_section_catalogue().await.expect("catalogue");
    assert_eq!(catalogue.len(), 3);
    assert_eq!(catalogue[1].key, "gate_check");

    let err = store
        .fetch_job(&JobId::new("missing"))
        .await
        .expect_err("missing job");
    assert_eq!(
        err,
        StoreError::Http {
            status: 404,
            detail: "Job not found".into()
        }
    );
    server.abort();
}

#[tokio::test]
async fn merged_rows_overlay_live_status_on_persisted_sections() {
    let (base_url, state, server) = spawn_mock_server().await;
    let tx = state.script_body();

    let controller = controller(&base_url);
    let catalogue = controller
        .store()
        .fetch_section_catalogue()
        .await
        .expect("catalogue");
    let job = controller
        .store()
        .fetch_job(&JobId::new("job-1"))
        .await
        .expect("job");

    let run = controller.start_pipeline(&JobId::new("job-1"), Phase::Analyze);
    send(
        &tx,
        "data: {\"section_key\":\"final_verdict\",\"status\":\"running\"}\n\n",
    );
    let snapshot = wait_for(&run, |s| s.events == 1).await;

    let rows = jobtrack_stream::merge_sections(
        &catalogue,
        Some(&job),
        &snapshot.statuses,
        Some(Phase::Analyze.section_phase()),
    );
    let summary: Vec<(String, SectionStatus)> =
        rows.into_iter().map(|r| (r.key, r.status)).collect();
    assert_eq!(
        summary,
        vec![
            ("final_verdict".to_string(), SectionStatus::Running),
            ("gate_check".to_string(), SectionStatus::Complete),
        ]
    );
    run.stop();
    server.abort();
}
