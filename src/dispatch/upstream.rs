use crate::catalog::BackendDescriptor;
use crate::conversation::ConversationTurn;
use crate::credential::Credential;
use crate::gemini::ApiError;
use std::future::Future;

/// 上游生成接口：一次调用 = 一次（后端, 凭据）尝试。
///
/// 成功时返回非空回复文本；传输错误、非 2xx、无法提取文本都以 `ApiError` 返回。
pub trait Upstream: Send + Sync {
    fn generate(
        &self,
        backend: &BackendDescriptor,
        credential: &Credential,
        messages: &[ConversationTurn],
    ) -> impl Future<Output = Result<String, ApiError>> + Send;
}
