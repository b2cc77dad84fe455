//! A chat room: one shared model session, a short message log and a
//! broadcast channel that fans every update out to the room's viewers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::{DynChatSession, GenerateParams};

/// Number of log lines a room keeps for late joiners.
pub const MESSAGE_BACK_LOG: usize = 10;

pub const GPT_USER_NAME: &str = "GPT";
pub const WELCOME_PROMPT: &str =
    "Create a nice, short welcoming message to a new visitor of this chat.";
pub const WELCOME_MAX_TOKENS: u32 = 50;
pub const MAX_TOKENS: u32 = 100;

const CHANNEL_CAPACITY: usize = 256;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Free,
    GptWrites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Message,
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub id: String,
    /// Unix time in seconds
    pub timestamp: f64,
    pub kind: LineKind,
    pub user_name: String,
    pub text: String,
}

impl LogLine {
    fn new(id: String, kind: LineKind, user_name: &str, text: &str) -> Self {
        Self {
            id,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            kind,
            user_name: user_name.to_string(),
            text: text.to_string(),
        }
    }
}

/// What viewers receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoomEvent {
    Line(LogLine),
    /// GPT started an answer
    Wait {
        id: String,
        dt: DateTime<Utc>,
        user_name: String,
    },
    Append {
        id: String,
        message: String,
    },
    Complete {
        id: String,
    },
}

pub struct Room {
    pub name: String,
    pub model_name: String,
    pub summary: String,
    /// `(key, value)` rows of the model config table
    pub config_rows: Vec<(String, String)>,
    pub thread_count: usize,
    session: Mutex<DynChatSession>,
    users: Mutex<Vec<String>>,
    logs: Mutex<VecDeque<LogLine>>,
    state: Mutex<RoomState>,
    events: broadcast::Sender<RoomEvent>,
}

impl Room {
    pub fn new(name: &str, model_name: &str, session: DynChatSession) -> Self {
        let config = session.config();
        let config_rows = config
            .entries()
            .map(|(key, value)| {
                let shown = match value.as_str() {
                    Some(s) => format!("{s:?}"),
                    None => value.to_string(),
                };
                (key.to_string(), shown)
            })
            .collect();
        let summary = config.summary();
        let thread_count = session.thread_count();
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            name: name.to_string(),
            model_name: model_name.to_string(),
            summary,
            config_rows,
            thread_count,
            session: Mutex::new(session),
            users: Mutex::default(),
            logs: Mutex::default(),
            state: Mutex::new(RoomState::Free),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    fn send(&self, event: RoomEvent) {
        // no viewers is fine
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> RoomState {
        *lock(&self.state)
    }

    fn set_state(&self, state: RoomState) {
        *lock(&self.state) = state;
    }

    pub fn users(&self) -> Vec<String> {
        lock(&self.users).clone()
    }

    pub fn add_user(&self, user_name: &str) {
        lock(&self.users).push(user_name.to_string());
    }

    /// Removes one entry, the same user may watch from several tabs.
    pub fn remove_user(&self, user_name: &str) {
        let mut users = lock(&self.users);
        if let Some(pos) = users.iter().position(|u| u == user_name) {
            users.remove(pos);
        }
    }

    pub fn history(&self) -> Vec<LogLine> {
        lock(&self.logs).iter().cloned().collect()
    }

    fn log(&self, line: LogLine) {
        let mut logs = lock(&self.logs);
        logs.push_back(line);
        while logs.len() > MESSAGE_BACK_LOG {
            logs.pop_front();
        }
    }

    /// Log a line and send it to all viewers.
    pub fn post(&self, kind: LineKind, user_name: &str, text: &str) -> LogLine {
        let line = LogLine::new(Uuid::new_v4().simple().to_string(), kind, user_name, text);
        tracing::info!(room = %self.name, kind = ?kind, user = user_name, "{}", text);
        self.log(line.clone());
        self.send(RoomEvent::Line(line.clone()));
        line
    }

    /// Let GPT answer `prompt`, streaming to all viewers. Blocks while the
    /// model generates; concurrent calls queue on the session.
    pub fn gpt_answer(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let mut session = lock(&self.session);
        let turn = GptTurn::start(self);

        let answer = session.generate(prompt, &GenerateParams::new(max_tokens), &mut |token| {
            turn.append(token);
            ControlFlow::Continue(())
        })?;

        let answer = answer.trim().to_string();
        if !answer.is_empty() {
            self.log(LogLine::new(
                turn.id.clone(),
                LineKind::Message,
                GPT_USER_NAME,
                &answer,
            ));
        }
        Ok(answer)
    }
}

/// One GPT answer in progress. Marks the room busy and announces the answer;
/// dropping it frees the room and completes the answer, also on errors.
struct GptTurn<'a> {
    room: &'a Room,
    id: String,
}

impl<'a> GptTurn<'a> {
    fn start(room: &'a Room) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        room.set_state(RoomState::GptWrites);
        room.send(RoomEvent::Wait {
            id: id.clone(),
            dt: Utc::now(),
            user_name: GPT_USER_NAME.to_string(),
        });
        Self { room, id }
    }

    fn append(&self, token: &str) {
        let token = token.replace('\n', " ");
        tracing::trace!(room = %self.room.name, "GPT token: {:?}", token);
        self.room.send(RoomEvent::Append {
            id: self.id.clone(),
            message: token,
        });
    }
}

impl Drop for GptTurn<'_> {
    fn drop(&mut self) {
        self.room.set_state(RoomState::Free);
        self.room.send(RoomEvent::Complete {
            id: self.id.clone(),
        });
    }
}

/// Run [`Room::gpt_answer`] off the async runtime; failures are logged.
pub async fn answer(room: Arc<Room>, prompt: String, max_tokens: u32) {
    let name = room.name.clone();
    let result = tokio::task::spawn_blocking(move || room.gpt_answer(&prompt, max_tokens))
        .await
        .context("GPT task failed")
        .and_then(|r| r);
    if let Err(err) = result {
        tracing::error!(room = %name, "GPT answer failed: {err:#}");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::prompt::ModelConfig;
    use crate::session::ChatSession;
    use crate::session::testing::ScriptedGenerator;
    use std::path::Path;

    pub fn scripted_session(model_name: &str, replies: &[&str]) -> DynChatSession {
        ChatSession::new(
            Box::new(ScriptedGenerator::new(replies)),
            ModelConfig::new(Path::new(model_name), None),
        )
    }

    pub fn room(replies: &[&str]) -> Room {
        let model = "orca-mini-3b-gguf2-q4_0.gguf";
        Room::new("test", model, scripted_session(model, replies))
    }

    /// A room whose generator errors after streaming its reply.
    pub fn failing_room(reply: &str) -> Room {
        let model = "orca-mini-3b-gguf2-q4_0.gguf";
        let mut generator = ScriptedGenerator::new(&[reply]);
        generator.fail = true;
        let session: DynChatSession =
            ChatSession::new(Box::new(generator), ModelConfig::new(Path::new(model), None));
        Room::new("test", model, session)
    }
}
