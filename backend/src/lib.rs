pub mod config;
pub mod engine;
pub mod message;
pub mod persist;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use draw_core::{default_roster, DrawError, EntityStore, GiftId, RosterDocument, Session};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RosterConfig;
use crate::engine::{DrawCommand, DrawEngine, EngineError, ServerMessage};
use crate::persist::TieredStore;

#[derive(Clone)]
pub struct AppState {
    engine: DrawEngine,
    admin_password: Arc<str>,
}

impl AppState {
    pub fn new(engine: DrawEngine, admin_password: impl Into<String>) -> Self {
        Self {
            engine,
            admin_password: Arc::from(admin_password.into()),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let provided = headers
            .get("x-admin-password")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        provided == &*self.admin_password
    }
}

/// The session to start the engine with: the stored one if any tier has it,
/// else the roster file from the config, else the placeholder roster.
///
/// A stored record that cannot be read is an error rather than an empty store,
/// so a fresh session never overwrites it.
pub async fn restore_session(
    store: &TieredStore,
    roster: &RosterConfig,
) -> anyhow::Result<Session> {
    let stored = store.load().await.context(
        "refusing to start over a stored session that cannot be read; move it aside to start fresh",
    )?;
    if let Some(record) = stored {
        info!(saved_at = record.saved_at, stage = ?record.stage, "resuming stored session");
        return Ok(record.into_session());
    }

    let document = match &roster.path {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read roster file {}", path.display()))?;
            serde_json::from_slice::<RosterDocument>(&bytes)
                .with_context(|| format!("failed to parse roster file {}", path.display()))?
        }
        None => default_roster(roster.size),
    };
    info!(
        participants = document.participants.len(),
        gifts = document.gifts.len(),
        "no stored session, seeding a new one"
    );
    let store =
        EntityStore::new(document.participants, document.gifts).context("invalid seed roster")?;
    Ok(Session::new(store))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/session", get(get_session))
        .route("/draw/start", post(start_draw))
        .route("/draw/proceed", post(proceed_to_gift))
        .route("/draw/gift/auto", post(auto_select_gift))
        .route("/draw/gift/:gift_id", post(select_gift))
        .route("/draw/confirm", post(confirm_match))
        .route("/admin/export", get(export_roster))
        .route("/admin/roster", post(commit_roster))
        .route("/admin/reset", post(reset_matches))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn get_session(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.view().await)
}

async fn run_command(state: &AppState, command: DrawCommand) -> Response {
    match state.engine.dispatch(command).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn start_draw(State(state): State<AppState>) -> Response {
    run_command(&state, DrawCommand::StartDraw).await
}

async fn proceed_to_gift(State(state): State<AppState>) -> Response {
    run_command(&state, DrawCommand::ProceedToGift).await
}

async fn select_gift(State(state): State<AppState>, Path(gift_id): Path<GiftId>) -> Response {
    run_command(&state, DrawCommand::SelectGift { gift_id }).await
}

async fn auto_select_gift(State(state): State<AppState>) -> Response {
    run_command(&state, DrawCommand::AutoSelectGift).await
}

async fn confirm_match(State(state): State<AppState>) -> Response {
    run_command(&state, DrawCommand::ConfirmMatch).await
}

async fn export_roster(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.export().await)
}

async fn commit_roster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(roster): Json<RosterDocument>,
) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid admin password").into_response();
    }
    admin_response(state.engine.admin_commit(roster).await)
}

async fn reset_matches(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid admin password").into_response();
    }
    admin_response(state.engine.reset().await)
}

fn admin_response(result: Result<engine::SessionView, EngineError>) -> Response {
    match result {
        Ok(view) => Json(view).into_response(),
        Err(EngineError::Draw(
            e @ (DrawError::DuplicateParticipant(_) | DrawError::DuplicateGift(_)),
        )) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(EngineError::Draw(e)) => (StatusCode::CONFLICT, e.to_string()).into_response(),
        Err(EngineError::Persist(e)) => {
            (StatusCode::INSUFFICIENT_STORAGE, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Command(DrawCommand),
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn send_json(sender: &WsSender, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to encode server message: {e}");
            return Ok(());
        }
    };
    sender.lock().await.send(Message::Text(text)).await
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let (sender, mut receiver) = stream.split();
    let sender: WsSender = Arc::new(Mutex::new(sender));

    // Subscribe before taking the snapshot so no update falls in between.
    let mut rx = state.engine.subscribe();
    let snapshot = state.engine.view().await;
    if send_json(&sender, &ServerMessage::State(snapshot)).await.is_err() {
        return;
    }
    debug!("screen connected");

    let sender_clone = sender.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if send_json(&sender_clone, &msg).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "screen fell behind on updates"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let engine = state.engine.clone();
    let sender_err = sender.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Command(command)) => {
                    if let Err(e) = engine.dispatch(command).await {
                        let _ = sender_err
                            .lock()
                            .await
                            .send(Message::Text(format!("error:{e}")))
                            .await;
                    }
                }
                Err(e) => debug!("ignoring websocket frame: {e}"),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("screen disconnected");
}
