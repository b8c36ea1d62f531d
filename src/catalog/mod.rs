//! 模型目录：固定顺序的候选后端列表，顺序即回退优先级。
//!
//! 每日上限只用于估算剩余额度，调度时不据此跳过任何后端。

use anyhow::anyhow;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub id: String,
    pub daily_limit: u32,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, daily_limit: u32) -> Self {
        Self {
            id: id.into(),
            daily_limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    backends: Vec<BackendDescriptor>,
}

impl ModelCatalog {
    pub fn new(backends: Vec<BackendDescriptor>) -> anyhow::Result<Self> {
        if backends.is_empty() {
            return Err(anyhow!("模型目录不能为空"));
        }
        Ok(Self { backends })
    }

    pub fn from_pairs<I, S>(pairs: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(id, limit)| BackendDescriptor::new(id, limit))
                .collect(),
        )
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
