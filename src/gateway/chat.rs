use super::AppState;
use crate::conversation::HistoryEntry;
use crate::dispatch::{DispatchOutcome, Upstream};
use crate::error::AppError;
use crate::logging::{self, LogLevel};
use anyhow::Context;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// 入站请求：`{ message, history: [{ role, parts: [{ text }] }] }`。
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

pub async fn handle_chat<U: Upstream + 'static>(
    State(state): State<Arc<AppState<U>>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChatResponse>, AppError> {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let result = chat(state, &body).await;
    log_client_response(log_level, start, &result);
    result.map(|reply| Json(ChatResponse { reply }))
}

async fn chat<U: Upstream + 'static>(
    state: Arc<AppState<U>>,
    body: &[u8],
) -> Result<String, AppError> {
    let req: ChatRequest = sonic_rs::from_slice(body)
        .map_err(|_| AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。"))?;
    let message = req.message.unwrap_or_default();
    let history = req.history;

    // 独立任务执行调度：上游处理中的 panic 只影响本次请求，并以通用 500 返回。
    let outcome = tokio::spawn(async move { state.engine.dispatch(&history, &message).await })
        .await
        .context("调度任务异常退出")??;

    match outcome {
        DispatchOutcome::Success { reply, .. } => Ok(reply),
        DispatchOutcome::Failure { last_error } => Err(AppError::exhausted(last_error)),
    }
}

fn log_client_response(log_level: LogLevel, start: Instant, result: &Result<String, AppError>) {
    if !log_level.client_enabled() {
        return;
    }
    let (status, body) = match result {
        Ok(reply) => (
            StatusCode::OK,
            serde_json::json!({ "reply": reply }),
        ),
        Err(e) => (e.status(), serde_json::json!({ "error": e.to_string() })),
    };
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    logging::client_response(status.as_u16(), start.elapsed(), &bytes);
}
