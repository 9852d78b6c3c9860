//! In-process fake of the ticketing backend.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use ticketsync_lib::settings::{
    SettingsStore, KEY_ASSIGNMENTS_BASE_URL, KEY_NOTIFICATIONS_BASE_URL,
    KEY_STREAM_RETRY_INITIAL_MS, KEY_STREAM_RETRY_MAX_MS, KEY_TICKETS_BASE_URL,
    KEY_USERS_BASE_URL,
};
use ticketsync_lib::state::MemoryVault;
use ticketsync_lib::types::{Identity, Role, Session, TokenPair};
use ticketsync_lib::App;

pub fn jwt(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub fn token(label: &str) -> String {
    let exp = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
    jwt(json!({ "exp": exp, "jti": label }))
}

#[derive(Default)]
struct Counters {
    refresh: AtomicUsize,
    tickets: AtomicUsize,
    always_401: AtomicUsize,
    stream_connects: AtomicUsize,
}

#[derive(Clone)]
pub struct Backend {
    counters: Arc<Counters>,
    pub refresh_fails: Arc<AtomicBool>,
    /// Access token the services currently accept.
    pub valid_access: Arc<Mutex<String>>,
    /// User ids in stream connection order.
    pub stream_users: Arc<Mutex<Vec<i64>>>,
    /// `Last-Event-ID` sent with each stream connection.
    pub last_event_ids: Arc<Mutex<Vec<Option<String>>>>,
    stream_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl Backend {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            refresh_fails: Arc::new(AtomicBool::new(false)),
            valid_access: Arc::new(Mutex::new(token("initial"))),
            stream_users: Arc::new(Mutex::new(Vec::new())),
            last_event_ids: Arc::new(Mutex::new(Vec::new())),
            stream_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.counters.refresh.load(Ordering::SeqCst)
    }

    pub fn ticket_calls(&self) -> usize {
        self.counters.tickets.load(Ordering::SeqCst)
    }

    pub fn always_401_calls(&self) -> usize {
        self.counters.always_401.load(Ordering::SeqCst)
    }

    pub fn stream_connects(&self) -> usize {
        self.counters.stream_connects.load(Ordering::SeqCst)
    }

    /// Stops accepting the current access token, as a server-side revocation would.
    pub fn revoke_access(&self) {
        *self.valid_access.lock() = token("revoked");
    }

    /// Writes raw bytes to the most recent stream. False if nobody is reading.
    pub fn push(&self, chunk: &str) -> bool {
        match self.stream_tx.lock().as_ref() {
            Some(tx) => tx.send(chunk.to_string()).is_ok(),
            None => false,
        }
    }

    /// Ends the current stream body as if the server closed it.
    pub fn end_stream(&self) {
        self.stream_tx.lock().take();
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.valid_access.lock());
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }
}

pub struct Server {
    pub base_url: String,
    pub backend: Backend,
}

pub async fn spawn() -> Server {
    let backend = Backend::new();
    let router = Router::new()
        .route("/auth/login/", post(login))
        .route("/auth/refresh/", post(refresh))
        .route("/tickets/", get(tickets))
        .route("/always-401/", get(always_401))
        .route("/forbidden/", get(forbidden))
        .route("/broken/", get(broken))
        .route("/notifications/stream/{user_id}/", get(stream))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Server {
        base_url: format!("http://{addr}"),
        backend,
    }
}

impl Server {
    pub fn current_token(&self) -> String {
        self.backend.valid_access.lock().clone()
    }

    pub fn settings(&self) -> SettingsStore {
        let mut overrides = Map::new();
        for key in [
            KEY_TICKETS_BASE_URL,
            KEY_NOTIFICATIONS_BASE_URL,
            KEY_ASSIGNMENTS_BASE_URL,
            KEY_USERS_BASE_URL,
        ] {
            overrides.insert(key.to_string(), json!(self.base_url));
        }
        overrides.insert(KEY_STREAM_RETRY_INITIAL_MS.to_string(), json!(250));
        overrides.insert(KEY_STREAM_RETRY_MAX_MS.to_string(), json!(500));
        SettingsStore::from_map(overrides)
    }

    /// App whose persisted session holds `access`, already started.
    pub async fn app_with_session(&self, access: String, id: i64, role: Role) -> App {
        let session = Session::new(
            TokenPair {
                access,
                refresh: "refresh-0".to_string(),
            },
            Identity { id, role },
        );
        let vault = MemoryVault::with_session(&session);
        let app = App::with_vault(self.settings(), Some(Arc::new(vault))).unwrap();
        app.start().await;
        app
    }

    pub async fn signed_out_app(&self) -> App {
        let app = App::with_vault(self.settings(), None).unwrap();
        app.start().await;
        app
    }
}

async fn login(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    let (id, role) = match body["username"].as_str() {
        Some("admin") => (1, "admin"),
        Some("admin2") => (3, "admin"),
        Some("carol") => (2, "customer"),
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    };
    let access = backend.valid_access.lock().clone();
    Json(json!({
        "access": access,
        "refresh": format!("refresh-{id}"),
        "user": { "id": id, "role": role },
    }))
    .into_response()
}

async fn refresh(State(backend): State<Backend>) -> Response {
    let n = backend.counters.refresh.fetch_add(1, Ordering::SeqCst) + 1;
    // Long enough for concurrent 401s to pile up behind the renewal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if backend.refresh_fails.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let access = token(&format!("renewed-{n}"));
    *backend.valid_access.lock() = access.clone();
    Json(json!({ "access": access, "refresh": format!("refresh-{n}") })).into_response()
}

async fn tickets(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    backend.counters.tickets.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([{ "id": 1, "title": "Printer on fire" }])).into_response()
}

async fn always_401(State(backend): State<Backend>) -> StatusCode {
    backend.counters.always_401.fetch_add(1, Ordering::SeqCst);
    StatusCode::UNAUTHORIZED
}

async fn forbidden() -> (StatusCode, &'static str) {
    (StatusCode::FORBIDDEN, "not your ticket")
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn stream(
    State(backend): State<Backend>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    backend.counters.stream_connects.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    backend.stream_users.lock().push(user_id);
    backend.last_event_ids.lock().push(
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *backend.stream_tx.lock() = Some(tx);
    let body = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}
