//! 调度器：按模型目录顺序逐个尝试，第一次成功即返回。
//!
//! - 每个后端只尝试一次，每次尝试独立随机抽取一个凭据；
//! - 不重试、不退避、不做跨请求熔断；
//! - 仅在成功时记录一次用量。

mod upstream;

pub use upstream::Upstream;

use crate::catalog::ModelCatalog;
use crate::conversation::{self, HistoryEntry};
use crate::credential::CredentialPool;
use crate::error::PreconditionError;
use crate::gemini::ApiError;
use crate::usage::UsageTracker;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success {
        reply: String,
        backend_id: String,
        credential_index: usize,
    },
    /// 所有后端均失败，只保留最后一次尝试的错误信息。
    Failure { last_error: String },
}

#[derive(Debug)]
pub struct DispatchEngine<U> {
    upstream: U,
    pool: Arc<CredentialPool>,
    catalog: Arc<ModelCatalog>,
    usage: Arc<UsageTracker>,
    attempt_timeout: Option<Duration>,
}

impl<U: Upstream> DispatchEngine<U> {
    pub fn new(
        upstream: U,
        pool: Arc<CredentialPool>,
        catalog: Arc<ModelCatalog>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            upstream,
            pool,
            catalog,
            usage,
            attempt_timeout: None,
        }
    }

    /// 单次尝试的超时；超时按普通失败处理并切换到下一个后端。
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub async fn dispatch(
        &self,
        history: &[HistoryEntry],
        new_message: &str,
    ) -> Result<DispatchOutcome, PreconditionError> {
        if self.pool.is_empty() {
            return Err(PreconditionError::EmptyPool);
        }
        let messages = conversation::normalize(history, new_message)?;

        let mut last_error: Option<String> = None;

        for backend in self.catalog.backends() {
            let credential = self.pool.pick()?;

            let call = self.upstream.generate(backend, credential, &messages);
            let result = match self.attempt_timeout {
                Some(t) => tokio::time::timeout(t, call)
                    .await
                    .unwrap_or_else(|_| Err(ApiError::Timeout(t))),
                None => call.await,
            };

            match result {
                Ok(reply) => {
                    let used = self
                        .usage
                        .record_success(credential.index, &backend.id)
                        .await;
                    let remaining = self.usage.remaining(&backend.id, used);
                    if remaining < 0 {
                        tracing::warn!(
                            backend = %backend.id,
                            credential = %credential.masked(),
                            used,
                            remaining,
                            "已超出估算的每日额度"
                        );
                    } else {
                        tracing::info!(
                            backend = %backend.id,
                            credential = %credential.masked(),
                            used,
                            remaining,
                            "请求成功"
                        );
                    }
                    return Ok(DispatchOutcome::Success {
                        reply,
                        backend_id: backend.id.clone(),
                        credential_index: credential.index,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        backend = %backend.id,
                        credential = %credential.masked(),
                        error = %e,
                        "后端请求失败，尝试下一个模型"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| "没有可用的模型".to_string());
        tracing::error!(
            attempts = self.catalog.len(),
            error = %last_error,
            "所有模型均请求失败"
        );
        Ok(DispatchOutcome::Failure { last_error })
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackendDescriptor;
    use crate::conversation::{ConversationTurn, Role};
    use crate::credential::Credential;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 按后端 ID 预设结果的假上游；记录每次调用。
    #[derive(Default)]
    struct ScriptedUpstream {
        replies: HashMap<String, Result<String, u16>>,
        delay: HashMap<String, Duration>,
        calls: Mutex<Vec<(String, usize, Vec<ConversationTurn>)>>,
    }

    impl ScriptedUpstream {
        fn reply(mut self, backend: &str, text: &str) -> Self {
            self.replies
                .insert(backend.to_string(), Ok(text.to_string()));
            self
        }

        fn fail(mut self, backend: &str, status: u16) -> Self {
            self.replies.insert(backend.to_string(), Err(status));
            self
        }

        fn slow(mut self, backend: &str, d: Duration) -> Self {
            self.delay.insert(backend.to_string(), d);
            self
        }

        fn calls(&self) -> Vec<(String, usize, Vec<ConversationTurn>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Upstream for ScriptedUpstream {
        async fn generate(
            &self,
            backend: &BackendDescriptor,
            credential: &Credential,
            messages: &[ConversationTurn],
        ) -> Result<String, ApiError> {
            self.calls.lock().unwrap().push((
                backend.id.clone(),
                credential.index,
                messages.to_vec(),
            ));
            if let Some(d) = self.delay.get(&backend.id) {
                tokio::time::sleep(*d).await;
            }
            match self.replies.get(&backend.id) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(status)) => Err(ApiError::Http {
                    status: *status,
                    message: format!("{} failed", backend.id),
                }),
                None => Err(ApiError::EmptyReply {
                    reason: "empty response".to_string(),
                }),
            }
        }
    }

    fn engine(upstream: ScriptedUpstream, keys: &[&str]) -> DispatchEngine<ScriptedUpstream> {
        let catalog = Arc::new(
            ModelCatalog::from_pairs([("m1", 20), ("m2", 20), ("m3", 200)]).unwrap(),
        );
        let usage = Arc::new(UsageTracker::new(&catalog, 0));
        DispatchEngine::new(
            upstream,
            Arc::new(CredentialPool::new(keys.iter().copied())),
            catalog,
            usage,
        )
    }

    #[tokio::test]
    async fn first_success_stops_iteration_and_records_once() {
        let e = engine(
            ScriptedUpstream::default().reply("m1", "hi").reply("m2", "no"),
            &["k0"],
        );
        let out = e.dispatch(&[], "hello").await.unwrap();
        assert_eq!(
            out,
            DispatchOutcome::Success {
                reply: "hi".to_string(),
                backend_id: "m1".to_string(),
                credential_index: 0,
            }
        );
        assert_eq!(e.upstream.calls().len(), 1);
        assert_eq!(e.usage().used(0, "m1").await, 1);
        assert_eq!(e.usage().snapshot().await.entries.len(), 1);
    }

    #[tokio::test]
    async fn falls_back_in_catalog_order() {
        let e = engine(
            ScriptedUpstream::default()
                .fail("m1", 429)
                .fail("m2", 503)
                .reply("m3", "from m3"),
            &["k0", "k1"],
        );
        let out = e.dispatch(&[], "hello").await.unwrap();
        let DispatchOutcome::Success {
            reply,
            backend_id,
            credential_index,
        } = out
        else {
            panic!("expected success");
        };
        assert_eq!(reply, "from m3");
        assert_eq!(backend_id, "m3");

        let order: Vec<String> = e.upstream.calls().into_iter().map(|c| c.0).collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
        assert_eq!(e.usage().used(credential_index, "m3").await, 1);
        assert_eq!(e.usage().used(credential_index, "m1").await, 0);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_only() {
        let e = engine(
            ScriptedUpstream::default()
                .fail("m1", 429)
                .fail("m2", 500)
                .fail("m3", 503),
            &["k0", "k1", "k2"],
        );
        let out = e.dispatch(&[], "hello").await.unwrap();
        let DispatchOutcome::Failure { last_error } = out else {
            panic!("expected failure");
        };
        assert!(last_error.contains("503"));
        assert!(last_error.contains("m3 failed"));
        assert!(!last_error.contains("m1 failed"));

        // 每个后端恰好一次，且不记录用量。
        assert_eq!(e.upstream.calls().len(), 3);
        assert!(e.usage().snapshot().await.entries.is_empty());
    }

    #[tokio::test]
    async fn empty_pool_makes_no_calls() {
        let e = engine(ScriptedUpstream::default().reply("m1", "hi"), &[]);
        let err = e.dispatch(&[], "hello").await.unwrap_err();
        assert_eq!(err, PreconditionError::EmptyPool);
        assert!(e.upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_message_makes_no_calls() {
        let e = engine(ScriptedUpstream::default().reply("m1", "hi"), &["k0"]);
        let err = e.dispatch(&[], "").await.unwrap_err();
        assert_eq!(err, PreconditionError::EmptyMessage);
        assert!(e.upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn same_normalized_messages_reach_every_attempt() {
        let e = engine(
            ScriptedUpstream::default().fail("m1", 500).reply("m2", "ok"),
            &["k0"],
        );
        let history = vec![
            HistoryEntry::new("model", "greeting"),
            HistoryEntry::new("user", "q1"),
            HistoryEntry::new("model", "a1"),
        ];
        e.dispatch(&history, "q2").await.unwrap();

        let calls = e.upstream.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].2, calls[1].2);
        assert_eq!(calls[0].2[0].role, Role::User);
        assert_eq!(calls[0].2.last(), Some(&ConversationTurn::user("q2")));
    }

    #[tokio::test]
    async fn ceilings_are_not_enforced() {
        let e = engine(ScriptedUpstream::default().reply("m1", "hi"), &["k0"]);
        for _ in 0..25 {
            e.dispatch(&[], "hello").await.unwrap();
        }
        let used = e.usage().used(0, "m1").await;
        assert_eq!(used, 25);
        assert_eq!(e.usage().remaining("m1", used), -5);
    }

    #[tokio::test]
    async fn attempt_timeout_advances_to_next_backend() {
        let e = engine(
            ScriptedUpstream::default()
                .reply("m1", "too late")
                .slow("m1", Duration::from_secs(5))
                .reply("m2", "fast"),
            &["k0"],
        )
        .with_attempt_timeout(Some(Duration::from_millis(50)));

        let out = e.dispatch(&[], "hello").await.unwrap();
        assert!(matches!(
            out,
            DispatchOutcome::Success { ref backend_id, .. } if backend_id == "m2"
        ));
        assert_eq!(e.usage().used(0, "m1").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatches_count_every_success() {
        let e = Arc::new(engine(ScriptedUpstream::default().reply("m1", "hi"), &["k0"]));
        let n = 64;

        let tasks = (0..n).map(|_| {
            let e = e.clone();
            tokio::spawn(async move { e.dispatch(&[], "hello").await })
        });
        for r in futures::future::join_all(tasks).await {
            assert!(matches!(
                r.unwrap().unwrap(),
                DispatchOutcome::Success { .. }
            ));
        }

        assert_eq!(e.usage().used(0, "m1").await, n as u64);
    }
}
