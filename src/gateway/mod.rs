//! HTTP 网关：把入站聊天请求交给调度器，并暴露目录/用量查询接口。

pub mod chat;
pub mod usage;

use crate::config::Config;
use crate::dispatch::{DispatchEngine, Upstream};
use crate::gemini::GeminiClient;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub struct AppState<U = GeminiClient> {
    pub cfg: Config,
    pub engine: DispatchEngine<U>,
}

pub fn router<U: Upstream + 'static>(state: Arc<AppState<U>>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/chat", post(chat::handle_chat::<U>))
        .route("/api/models", get(usage::handle_models::<U>))
        .route("/api/usage", get(usage::handle_usage::<U>))
        .with_state(state)
}

async fn handle_health() -> &'static str {
    "ok"
}
