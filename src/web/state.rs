use anyhow::Result;
use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

use super::room::{Room, RoomState};
use crate::model::ModelLoader;
use crate::session::DynChatSession;

static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid regex"));

/// Room names that would collide with fixed routes.
const RESERVED_ROOM_NAMES: &[&str] = &["user", "rooms", "lobby"];

/// Models offered in the lobby, the first one is preselected.
pub const OFFERED_MODELS: &[&str] = &[
    "em_german_mistral_v01.Q4_0.gguf",
    "orca-mini-3b-gguf2-q4_0.gguf",
    "wizardlm-13b-v1.2.Q4_0.gguf",
    "mistral-7b-openorca.Q4_0.gguf",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LobbyError {
    #[error("\"{0}\" is no valid name")]
    InvalidName(String),
    #[error("\"{0}\" is already taken")]
    NameTaken(String),
    #[error("\"{0}\" is not an offered model")]
    UnknownModel(String),
    #[error("Loading {model} failed: {reason}")]
    LoadFailed { model: String, reason: String },
}

pub fn validate_name(name: &str) -> Result<(), LobbyError> {
    if NAME.is_match(name) {
        Ok(())
    } else {
        Err(LobbyError::InvalidName(name.to_string()))
    }
}

/// Creates chat sessions for new rooms.
pub trait SessionLoader: Send + Sync {
    fn load<'a>(&'a self, model_name: &'a str) -> BoxFuture<'a, Result<DynChatSession>>;
}

impl SessionLoader for ModelLoader {
    fn load<'a>(&'a self, model_name: &'a str) -> BoxFuture<'a, Result<DynChatSession>> {
        Box::pin(ModelLoader::load(self, model_name))
    }
}

/// Row of the lobby room table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    pub model_name: String,
    pub users: usize,
    pub state: RoomState,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Server state, shared by all requests. Lives in memory only.
pub struct AppState {
    /// session key -> user name
    users: RwLock<HashMap<String, String>>,
    rooms: RwLock<BTreeMap<String, Arc<Room>>>,
    lobby: broadcast::Sender<()>,
    loader: Arc<dyn SessionLoader>,
    pub models: Vec<String>,
    pub default_user_name: String,
}

impl AppState {
    pub fn new(loader: Arc<dyn SessionLoader>, models: &[&str], default_user_name: String) -> Self {
        let (lobby, _) = broadcast::channel(16);
        Self {
            users: RwLock::default(),
            rooms: RwLock::default(),
            lobby,
            loader,
            models: models.iter().map(|m| m.to_string()).collect(),
            default_user_name,
        }
    }

    pub fn user_name(&self, session_key: &str) -> Option<String> {
        read(&self.users).get(session_key).cloned()
    }

    pub fn set_user_name(&self, session_key: &str, name: &str) -> Result<(), LobbyError> {
        validate_name(name)?;
        let mut users = write(&self.users);
        if users.values().any(|taken| taken == name) {
            return Err(LobbyError::NameTaken(name.to_string()));
        }
        users.insert(session_key.to_string(), name.to_string());
        tracing::info!(user = name, "user name set");
        Ok(())
    }

    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        read(&self.rooms).get(name).cloned()
    }

    pub fn rooms(&self) -> Vec<RoomSummary> {
        read(&self.rooms)
            .values()
            .map(|room| RoomSummary {
                name: room.name.clone(),
                model_name: room.model_name.clone(),
                users: room.users().len(),
                state: room.state(),
            })
            .collect()
    }

    pub fn subscribe_lobby(&self) -> broadcast::Receiver<()> {
        self.lobby.subscribe()
    }

    /// Tell lobby viewers that the room table changed.
    pub fn notify_lobby(&self) {
        let _ = self.lobby.send(());
    }

    fn check_room_name(&self, name: &str) -> Result<(), LobbyError> {
        validate_name(name)?;
        if RESERVED_ROOM_NAMES.contains(&name) {
            return Err(LobbyError::InvalidName(name.to_string()));
        }
        if read(&self.rooms).contains_key(name) {
            return Err(LobbyError::NameTaken(name.to_string()));
        }
        Ok(())
    }

    /// Load the model and register a new room.
    pub async fn create_room(&self, name: &str, model_name: &str) -> Result<Arc<Room>, LobbyError> {
        self.check_room_name(name)?;
        if !self.models.iter().any(|m| m == model_name) {
            return Err(LobbyError::UnknownModel(model_name.to_string()));
        }

        tracing::info!(room = name, model = model_name, "creating room");
        let session = self
            .loader
            .load(model_name)
            .await
            .map_err(|err| LobbyError::LoadFailed {
                model: model_name.to_string(),
                reason: format!("{err:#}"),
            })?;

        let room = Arc::new(Room::new(name, model_name, session));
        {
            let mut rooms = write(&self.rooms);
            // another request may have won while the model was loading
            if rooms.contains_key(name) {
                return Err(LobbyError::NameTaken(name.to_string()));
            }
            rooms.insert(name.to_string(), room.clone());
        }
        tracing::debug!(room = name, summary = %room.summary, "room created");
        self.notify_lobby();
        Ok(room)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::state;
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("Room_1-b").is_ok());
        assert_eq!(validate_name(""), Err(LobbyError::InvalidName(String::new())));
        assert!(validate_name("with space").is_err());
        assert!(validate_name("semi;colon").is_err());
        assert!(validate_name("ümlaut").is_err());
        assert_eq!(
            LobbyError::InvalidName("a b".into()).to_string(),
            "\"a b\" is no valid name"
        );
    }

    #[test]
    fn user_names_are_unique() {
        let state = state();
        state.set_user_name("s1", "alice").unwrap();
        assert_eq!(state.user_name("s1").as_deref(), Some("alice"));
        assert_eq!(
            state.set_user_name("s2", "alice"),
            Err(LobbyError::NameTaken("alice".into()))
        );
        assert!(state.set_user_name("s2", "no way").is_err());
        assert_eq!(state.user_name("s2"), None);
    }

    #[tokio::test]
    async fn create_room_registers_and_notifies() {
        let state = state();
        let mut lobby = state.subscribe_lobby();

        let room = state
            .create_room("test", "orca-mini-3b-gguf2-q4_0.gguf")
            .await
            .unwrap();
        assert_eq!(room.name, "test");
        assert!(lobby.try_recv().is_ok());
        assert_eq!(
            state.rooms(),
            vec![RoomSummary {
                name: "test".into(),
                model_name: "orca-mini-3b-gguf2-q4_0.gguf".into(),
                users: 0,
                state: RoomState::Free,
            }]
        );
        assert!(state.room("test").is_some());
        assert!(state.room("other").is_none());
    }

    #[tokio::test]
    async fn create_room_rejects_bad_input() {
        let state = state();
        state
            .create_room("test", "orca-mini-3b-gguf2-q4_0.gguf")
            .await
            .unwrap();

        let model = "orca-mini-3b-gguf2-q4_0.gguf";
        assert_eq!(
            state.create_room("test", model).await.err(),
            Some(LobbyError::NameTaken("test".into()))
        );
        assert_eq!(
            state.create_room("bad name", model).await.err(),
            Some(LobbyError::InvalidName("bad name".into()))
        );
        assert_eq!(
            state.create_room("rooms", model).await.err(),
            Some(LobbyError::InvalidName("rooms".into()))
        );
        assert_eq!(
            state.create_room("x", "evil.gguf").await.err(),
            Some(LobbyError::UnknownModel("evil.gguf".into()))
        );
        assert!(matches!(
            state.create_room("y", "broken.gguf").await.err(),
            Some(LobbyError::LoadFailed { .. })
        ));
        assert_eq!(state.rooms().len(), 1);
    }
}
