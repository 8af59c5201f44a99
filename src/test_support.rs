//! In-process stand-in for the chat backend, bound to an ephemeral port.

use crate::protocol::{ChatRequest, ChatResponse, ChatStats, HistoryPage, Message, Role, SearchResults};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

type Chunk = io::Result<Vec<u8>>;

#[derive(Default)]
struct Backend {
    requests: AtomicUsize,
    authorization: Mutex<Option<String>>,
    stream_requests: Mutex<Vec<ChatRequest>>,
    stream_body: Mutex<Option<mpsc::Receiver<Chunk>>>,
    stream_status: Mutex<Option<StatusCode>>,
    history: Mutex<Vec<Message>>,
    history_queries: Mutex<Vec<(usize, usize)>>,
    fail_history: AtomicBool,
    fail_clear: AtomicBool,
    hold_history: AtomicBool,
    release: Notify,
}

pub struct FakeBackend {
    base_url: String,
    state: Arc<Backend>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    offset: usize,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state = Arc::new(Backend::default());
        let app = axum::Router::new()
            .route("/api/chat", post(send))
            .route("/api/chat/stream", post(stream))
            .route("/api/chat/history/:id", get(history).delete(clear))
            .route("/api/chat/history/:id/search", get(search))
            .route("/api/chat/history/:id/export", get(export))
            .route("/api/chat/history/:id/stats", get(stats))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("fake backend address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}/api/", addr),
            state,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.authorization.lock().unwrap().clone()
    }

    /// Serves `body` as the complete response of the next stream request.
    pub fn set_stream_body(&self, body: &str) {
        let (tx, rx) = mpsc::channel(1);
        tx.try_send(Ok(body.as_bytes().to_vec())).unwrap();
        *self.state.stream_body.lock().unwrap() = Some(rx);
    }

    /// Returns a sender that feeds the next stream response chunk by chunk.
    pub fn stream_feed(&self) -> mpsc::Sender<Chunk> {
        let (tx, rx) = mpsc::channel(16);
        *self.state.stream_body.lock().unwrap() = Some(rx);
        tx
    }

    pub fn fail_stream_with(&self, status: u16) {
        *self.state.stream_status.lock().unwrap() = Some(StatusCode::from_u16(status).unwrap());
    }

    pub fn stream_requests(&self) -> Vec<ChatRequest> {
        self.state.stream_requests.lock().unwrap().clone()
    }

    /// Replaces the stored history with `count` messages, oldest first.
    pub fn seed_history(&self, count: usize) {
        let messages = (0..count)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::new(role, format!("message {i}"))
            })
            .collect();
        *self.state.history.lock().unwrap() = messages;
    }

    pub fn history_len(&self) -> usize {
        self.state.history.lock().unwrap().len()
    }

    pub fn history_queries(&self) -> Vec<(usize, usize)> {
        self.state.history_queries.lock().unwrap().clone()
    }

    pub fn fail_history(&self, fail: bool) {
        self.state.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clear(&self, fail: bool) {
        self.state.fail_clear.store(fail, Ordering::SeqCst);
    }

    /// Makes the next history request wait for [`FakeBackend::release_history`].
    /// Its page is computed before it waits.
    pub fn hold_next_history(&self) {
        self.state.hold_history.store(true, Ordering::SeqCst);
    }

    pub fn release_history(&self) {
        self.state.release.notify_one();
    }

    pub async fn wait_for_history_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.history_queries().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("history request never arrived");
    }
}

fn record(state: &Backend, headers: &HeaderMap) {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    *state.authorization.lock().unwrap() = authorization;
}

async fn send(
    State(state): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Json<ChatResponse> {
    record(&state, &headers);
    Json(ChatResponse {
        character_id: Some(request.character_id),
        response: format!("echo: {}", request.message),
        timestamp: crate::protocol::now_timestamp(),
    })
}

async fn stream(
    State(state): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    record(&state, &headers);
    state.stream_requests.lock().unwrap().push(request);

    if let Some(status) = *state.stream_status.lock().unwrap() {
        return (status, "backend unavailable").into_response();
    }

    let body = state.stream_body.lock().unwrap().take();
    match body {
        Some(rx) => (
            [("content-type", "text/event-stream")],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response(),
        None => (StatusCode::OK, "data: END\n\n").into_response(),
    }
}

async fn history(
    State(state): State<Arc<Backend>>,
    Path(_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Response {
    record(&state, &headers);
    if state.fail_history.load(Ordering::SeqCst) {
        state
            .history_queries
            .lock()
            .unwrap()
            .push((query.offset, query.limit));
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let page = {
        let messages = state.history.lock().unwrap();
        let end = messages.len().saturating_sub(query.offset);
        let start = end.saturating_sub(query.limit);
        HistoryPage {
            messages: messages[start..end].to_vec(),
            total: messages.len(),
            has_more: start > 0,
        }
    };
    state
        .history_queries
        .lock()
        .unwrap()
        .push((query.offset, query.limit));

    if state.hold_history.swap(false, Ordering::SeqCst) {
        state.release.notified().await;
    }

    Json(page).into_response()
}

async fn clear(
    State(state): State<Arc<Backend>>,
    Path(_id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    record(&state, &headers);
    if state.fail_clear.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.history.lock().unwrap().clear();
    StatusCode::OK
}

async fn search(
    State(state): State<Arc<Backend>>,
    Path(_id): Path<String>,
    Query(query): Query<SearchQuery>,
    headers: HeaderMap,
) -> Json<SearchResults> {
    record(&state, &headers);
    let results = state
        .history
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.content.contains(&query.q))
        .cloned()
        .collect();
    Json(SearchResults { results })
}

async fn export(
    State(state): State<Arc<Backend>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    record(&state, &headers);
    let messages = state.history.lock().unwrap().clone();
    Json(serde_json::json!({
        "character_id": id,
        "exported_at": crate::protocol::now_timestamp(),
        "messages": messages,
    }))
}

async fn stats(
    State(state): State<Arc<Backend>>,
    Path(_id): Path<String>,
    headers: HeaderMap,
) -> Json<ChatStats> {
    record(&state, &headers);
    let total_messages = state.history.lock().unwrap().len();
    Json(ChatStats {
        total_messages,
        chat_days: usize::from(total_messages > 0),
        total_characters: 1,
    })
}
