use crate::catalog::BackendDescriptor;
use crate::config::Config;
use crate::conversation::ConversationTurn;
use crate::credential::Credential;
use crate::dispatch::Upstream;
use crate::gemini::types::{GenerateRequest, GenerateResponse};
use crate::logging;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use sonic_rs::JsonValueTrait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("上游返回错误 {status}: {message}")]
    Http { status: u16, message: String },

    /// 构造时须先 `without_url()`：请求地址里带着明文 key。
    #[error("上游请求失败: {0}")]
    Transport(reqwest::Error),

    #[error("上游响应解析失败: {0}")]
    Json(#[from] sonic_rs::Error),

    #[error("上游未返回文本内容: {reason}")]
    EmptyReply { reason: String },

    #[error("上游请求超时（{}ms）", .0.as_millis())]
    Timeout(Duration),
}

impl ApiError {
    fn transport(e: reqwest::Error) -> Self {
        Self::Transport(e.without_url())
    }

    #[cfg(test)]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    system_instruction: String,
    user_agent: String,
    log_level: logging::LogLevel,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }

        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            system_instruction: cfg.system_instruction.clone(),
            user_agent: cfg.api_user_agent.clone(),
            log_level: cfg.log_level(),
        })
    }

    /// 不含凭据的请求地址。
    pub fn generate_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url,
            urlencoding::encode(model)
        )
    }

    fn build_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("gemini-relay")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    pub async fn generate_content(
        &self,
        model: &str,
        credential: &Credential,
        messages: &[ConversationTurn],
    ) -> Result<String, ApiError> {
        let base = self.generate_url(model);
        let url = format!("{base}?key={}", urlencoding::encode(credential.secret()));
        let req = GenerateRequest::new(messages, &self.system_instruction);
        let body = sonic_rs::to_vec(&req)?;
        let headers = self.build_headers();

        if self.log_level.backend_enabled() {
            let masked = logging::redact_key_param(&url, &credential.masked());
            logging::backend_request("POST", &masked, &headers, &body);
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(ApiError::transport)?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(ApiError::transport)?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
        }
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let parsed = sonic_rs::from_slice::<GenerateResponse>(&bytes)?;
        match parsed.reply_text() {
            Some(text) => Ok(text.to_string()),
            None => Err(ApiError::EmptyReply {
                reason: parsed.empty_reason(),
            }),
        }
    }
}

impl Upstream for GeminiClient {
    async fn generate(
        &self,
        backend: &BackendDescriptor,
        credential: &Credential,
        messages: &[ConversationTurn],
    ) -> Result<String, ApiError> {
        self.generate_content(&backend.id, credential, messages)
            .await
    }
}

/// 解析 Google 风格的错误体：`{"error":{"code":..,"message":..,"status":..}}`。
fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
    }

    let mut out_status = status;
    let mut message = String::new();

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        let err = err_resp.error;
        message = err.message;

        if let Some(i) = err.code.as_ref().and_then(|c| c.as_i64())
            && i > 0
            && i <= u16::MAX as i64
        {
            out_status = i as u16;
        }

        if message.is_empty() && !err.status.is_empty() {
            message = err.status;
        }
    }

    if message.is_empty() {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        message = if text.is_empty() {
            "Unknown error".to_string()
        } else {
            text.chars().take(512).collect()
        };
    }

    ApiError::Http {
        status: out_status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Captured {
        action: String,
        query: HashMap<String, String>,
        body: serde_json::Value,
    }

    #[derive(Clone)]
    struct MockState {
        status: StatusCode,
        reply: serde_json::Value,
        captured: Arc<Mutex<Option<Captured>>>,
    }

    async fn mock_generate(
        State(state): State<MockState>,
        Path(action): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        *state.captured.lock().unwrap() = Some(Captured {
            action,
            query,
            body,
        });
        (state.status, Json(state.reply.clone()))
    }

    async fn spawn_mock(
        status: StatusCode,
        reply: serde_json::Value,
    ) -> (GeminiClient, Arc<Mutex<Option<Captured>>>) {
        let captured = Arc::new(Mutex::new(None));
        let app = Router::new()
            .route("/v1beta/models/{action}", post(mock_generate))
            .with_state(MockState {
                status,
                reply,
                captured: captured.clone(),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let cfg = Config {
            base_url: format!("http://{addr}"),
            system_instruction: "be brief".to_string(),
            timeout_ms: 5_000,
            ..Config::default()
        };
        (GeminiClient::new(&cfg).unwrap(), captured)
    }

    #[tokio::test]
    async fn generate_content_extracts_reply_and_sends_key_as_param() {
        let (client, captured) = spawn_mock(
            StatusCode::OK,
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "pong"}]}}]
            }),
        )
        .await;

        let cred = Credential::new(0, "test-key-1234");
        let msgs = vec![ConversationTurn::user("ping")];
        let reply = client
            .generate_content("gemini-2.5-flash", &cred, &msgs)
            .await
            .unwrap();
        assert_eq!(reply, "pong");

        let cap = captured.lock().unwrap().clone().unwrap();
        assert_eq!(cap.action, "gemini-2.5-flash:generateContent");
        assert_eq!(cap.query.get("key").map(String::as_str), Some("test-key-1234"));
        assert_eq!(cap.body["contents"][0]["role"], "user");
        assert_eq!(cap.body["contents"][0]["parts"][0]["text"], "ping");
        assert_eq!(cap.body["systemInstruction"]["parts"][0]["text"], "be brief");
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let (client, _) = spawn_mock(
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}
            }),
        )
        .await;

        let err = client
            .generate_content("m", &Credential::new(0, "k"), &[ConversationTurn::user("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("Resource has been exhausted"));
    }

    #[tokio::test]
    async fn success_without_text_is_attempt_failure() {
        let (client, _) = spawn_mock(
            StatusCode::OK,
            serde_json::json!({"promptFeedback": {"blockReason": "SAFETY"}}),
        )
        .await;

        let err = client
            .generate_content("m", &Credential::new(0, "k"), &[ConversationTurn::user("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::EmptyReply { ref reason } if reason == "blockReason=SAFETY"));
    }

    #[tokio::test]
    async fn transport_error_does_not_leak_key() {
        // 绑定后立即释放，得到一个无人监听的端口。
        let addr = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let cfg = Config {
            base_url: format!("http://{addr}"),
            timeout_ms: 5_000,
            ..Config::default()
        };
        let client = GeminiClient::new(&cfg).unwrap();

        let err = client
            .generate_content(
                "m",
                &Credential::new(0, "AIzaTOPSECRETVALUE9f3c"),
                &[ConversationTurn::user("x")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
        let msg = err.to_string();
        assert!(!msg.contains("TOPSECRET"), "{msg}");
        assert!(!format!("{err:?}").contains("TOPSECRET"));
    }

    #[test]
    fn extract_error_details_falls_back_to_raw_body() {
        let err = extract_error_details(502, b"Bad Gateway");
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("Bad Gateway"));

        let err = extract_error_details(500, b"");
        assert!(err.to_string().contains("Unknown error"));

        let err = extract_error_details(400, br#"{"error":{"code":403,"status":"PERMISSION_DENIED"}}"#);
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("PERMISSION_DENIED"));
    }

    #[test]
    fn generate_url_never_contains_key() {
        let client = GeminiClient::new(&Config::default()).unwrap();
        let url = client.generate_url("gemini-2.5-flash");
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
