//! Multi-room browser chat.

pub mod handlers;
pub mod pages;
pub mod room;
pub mod state;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::cli::WebArgs;
use crate::model::ModelLoader;
use state::{AppState, OFFERED_MODELS, validate_name};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::lobby))
        .route("/user", post(handlers::set_user_name))
        .route("/rooms", post(handlers::create_room))
        .route("/lobby/ws", get(handlers::lobby_socket))
        .route("/:room", get(handlers::room_page))
        .route("/:room/", get(handlers::room_page))
        .route("/:room/ws", get(handlers::room_socket))
        .with_state(state)
}

/// Host name offered as the default user name, if it is a valid name.
fn default_user_name() -> String {
    let from_file = std::fs::read_to_string("/etc/hostname").ok();
    let from_env = ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok());
    first_valid_host_name(from_file.into_iter().chain(from_env))
}

fn first_valid_host_name(candidates: impl IntoIterator<Item = String>) -> String {
    candidates
        .into_iter()
        .map(|name| name.trim().split('.').next().unwrap_or_default().to_string())
        .find(|name| validate_name(name).is_ok())
        .unwrap_or_else(|| "guest".to_string())
}

/// `web` command.
pub async fn run(args: WebArgs) -> Result<()> {
    let loader = ModelLoader {
        source: args.source.clone(),
        context_size: args.context_size,
        threads: args.cpu_count,
    };
    let state = Arc::new(AppState::new(
        Arc::new(loader),
        OFFERED_MODELS,
        default_user_name(),
    ));

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("{} listening on http://{addr}", pages::TITLE);
    tracing::info!(%addr, model_dir = %args.source.model_dir.display(), "web chat started");

    axum::serve(listener, router(state))
        .await
        .context("Web server failed")?;
    Ok(())
}
