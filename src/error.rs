use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 前置条件错误：在发起任何上游请求之前即可判定，直接拒绝本次请求。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("未配置任何上游 API Key")]
    EmptyPool,

    #[error("消息内容不能为空")]
    EmptyMessage,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("所有模型均请求失败: {0}")]
    Exhausted(String),

    /// 细节只记录日志，对外只给通用提示。
    #[error("服务器内部错误")]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn exhausted(last_error: impl Into<String>) -> Self {
        Self::Exhausted(last_error.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Precondition(PreconditionError::EmptyMessage) => StatusCode::BAD_REQUEST,
            AppError::Precondition(PreconditionError::EmptyPool) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Exhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(e) = &self {
            tracing::error!(error = ?e, "请求处理出现内部错误");
        }

        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
