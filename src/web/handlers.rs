use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::pages::{self, Alert};
use super::room::{self, LineKind, MAX_TOKENS, Room, RoomEvent, WELCOME_MAX_TOKENS, WELCOME_PROMPT};
use super::state::AppState;

pub const SESSION_COOKIE: &str = "gpt4all_session";

type SharedState = Arc<AppState>;

/// Session key from the request cookie.
pub fn session_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// The request's session key, or a fresh one plus the cookie to store it.
fn ensure_session(headers: &HeaderMap) -> (String, Option<HeaderValue>) {
    if let Some(key) = session_key(headers) {
        return (key, None);
    }
    let key = Uuid::new_v4().simple().to_string();
    let cookie = HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={key}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .ok();
    (key, cookie)
}

fn with_cookie(response: impl IntoResponse, cookie: Option<HeaderValue>) -> Response {
    let mut response = response.into_response();
    if let Some(cookie) = cookie {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

fn lobby_response(state: &AppState, session: &str, alert: Option<&Alert>) -> Html<String> {
    match state.user_name(session) {
        None => Html(pages::user_name_page(&state.default_user_name, alert)),
        Some(_) => Html(pages::lobby_page(&state.models, &state.rooms(), alert)),
    }
}

pub async fn lobby(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let (session, cookie) = ensure_session(&headers);
    with_cookie(lobby_response(&state, &session, None), cookie)
}

#[derive(Debug, Deserialize)]
pub struct UserNameForm {
    pub name: String,
}

pub async fn set_user_name(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<UserNameForm>,
) -> Response {
    let (session, cookie) = ensure_session(&headers);
    let name = form.name.trim();
    match state.set_user_name(&session, name) {
        Ok(()) => with_cookie(Redirect::to("/"), cookie),
        Err(err) => {
            tracing::debug!("rejected user name: {err}");
            let alert = Alert::Error(err.to_string());
            with_cookie(lobby_response(&state, &session, Some(&alert)), cookie)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomForm {
    pub room: String,
    pub model: String,
}

pub async fn create_room(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<CreateRoomForm>,
) -> Response {
    let Some(session) = session_key(&headers) else {
        return Redirect::to("/").into_response();
    };
    if state.user_name(&session).is_none() {
        return Redirect::to("/").into_response();
    }

    let name = form.room.trim();
    let alert = match state.create_room(name, &form.model).await {
        Ok(room) => Alert::Success(format!(
            "Room \"{}\" with {} was created",
            room.name, room.model_name
        )),
        Err(err) => {
            tracing::warn!(room = name, "room not created: {err}");
            Alert::Error(err.to_string())
        }
    };
    lobby_response(&state, &session, Some(&alert)).into_response()
}

pub async fn room_page(
    State(state): State<SharedState>,
    Path(room_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    // no user name yet: back to the lobby
    if session_key(&headers)
        .and_then(|key| state.user_name(&key))
        .is_none()
    {
        return Redirect::to("/").into_response();
    }

    match state.room(&room_name) {
        Some(room) => Html(pages::room_page(&room)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Html(pages::room_not_found_page(&room_name)),
        )
            .into_response(),
    }
}

pub async fn room_socket(
    State(state): State<SharedState>,
    Path(room_name): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_name) = session_key(&headers).and_then(|key| state.user_name(&key)) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(room) = state.room(&room_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| viewer(socket, state, room, user_name))
}

/// Wire form of a room event.
fn encode<T: Serialize>(event: &T) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json)),
        Err(err) => {
            tracing::error!("failed to encode event: {err}");
            None
        }
    }
}

/// One browser tab viewing a room.
async fn viewer(socket: WebSocket, state: SharedState, room: Arc<Room>, user_name: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = room.subscribe();

    for line in room.history() {
        if let Some(message) = encode(&RoomEvent::Line(line)) {
            if sender.send(message).await.is_err() {
                return;
            }
        }
    }

    room.add_user(&user_name);
    room.post(LineKind::Join, &user_name, "Joined");
    state.notify_lobby();
    tokio::spawn(room::answer(
        room.clone(),
        WELCOME_PROMPT.to_string(),
        WELCOME_MAX_TOKENS,
    ));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(message) = encode(&event) else { continue };
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(room = %room.name, skipped, "viewer lagged behind");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    room.post(LineKind::Message, &user_name, text);
                    tokio::spawn(room::answer(room.clone(), text.to_string(), MAX_TOKENS));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    room.remove_user(&user_name);
    room.post(LineKind::Leave, &user_name, "Left");
    state.notify_lobby();
}

pub async fn lobby_socket(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| lobby_viewer(socket, state))
}

/// Pushes the room table whenever it changes.
async fn lobby_viewer(mut socket: WebSocket, state: SharedState) {
    let mut updates = state.subscribe_lobby();
    loop {
        let Some(message) = encode(&state.rooms()) else {
            break;
        };
        if socket.send(message).await.is_err() {
            break;
        }

        tokio::select! {
            update = updates.recv() => {
                if let Err(RecvError::Closed) = update {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
