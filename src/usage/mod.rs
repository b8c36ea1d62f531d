//! 用量统计：进程内计数器，键为（凭据下标, 后端 ID）。
//!
//! 计数按“配额日”归档：跨过配置时区的零点后，第一次记录会丢弃前一天的计数。
//! 不做持久化，重启即清零。

use crate::catalog::ModelCatalog;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UsageKey {
    credential_index: usize,
    backend_id: String,
}

#[derive(Debug)]
struct Inner {
    day: NaiveDate,
    counts: HashMap<UsageKey, u64>,
}

#[derive(Debug)]
pub struct UsageTracker {
    limits: HashMap<String, u32>,
    reset_offset: FixedOffset,
    inner: RwLock<Inner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub credential_index: usize,
    pub backend_id: String,
    pub used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub day: NaiveDate,
    pub entries: Vec<UsageEntry>,
}

impl UsageTracker {
    /// `reset_offset_hours`：配额日切换所在时区相对 UTC 的小时偏移。
    pub fn new(catalog: &ModelCatalog, reset_offset_hours: i32) -> Self {
        let limits = catalog
            .backends()
            .iter()
            .map(|b| (b.id.clone(), b.daily_limit))
            .collect();
        let reset_offset = FixedOffset::east_opt(reset_offset_hours.clamp(-14, 14) * 3600)
            .unwrap_or_else(|| Utc.fix());
        let day = current_day(reset_offset);
        Self {
            limits,
            reset_offset,
            inner: RwLock::new(Inner {
                day,
                counts: HashMap::new(),
            }),
        }
    }

    pub fn current_day(&self) -> NaiveDate {
        current_day(self.reset_offset)
    }

    /// 记录一次成功调用，返回计入后该组合当天的用量。
    pub async fn record_success(&self, credential_index: usize, backend_id: &str) -> u64 {
        self.record_success_on(self.current_day(), credential_index, backend_id)
            .await
    }

    async fn record_success_on(
        &self,
        day: NaiveDate,
        credential_index: usize,
        backend_id: &str,
    ) -> u64 {
        let mut inner = self.inner.write().await;
        if day > inner.day {
            if !inner.counts.is_empty() {
                tracing::info!(previous = %inner.day, current = %day, "进入新的配额日，重置用量计数");
            }
            inner.counts.clear();
            inner.day = day;
        }
        let count = inner
            .counts
            .entry(UsageKey {
                credential_index,
                backend_id: backend_id.to_string(),
            })
            .or_insert(0);
        *count += 1;
        *count
    }

    #[cfg(test)]
    pub async fn used(&self, credential_index: usize, backend_id: &str) -> u64 {
        self.used_on(self.current_day(), credential_index, backend_id)
            .await
    }

    #[cfg(test)]
    async fn used_on(&self, day: NaiveDate, credential_index: usize, backend_id: &str) -> u64 {
        let inner = self.inner.read().await;
        if day > inner.day {
            return 0;
        }
        inner
            .counts
            .get(&UsageKey {
                credential_index,
                backend_id: backend_id.to_string(),
            })
            .copied()
            .unwrap_or(0)
    }

    /// 剩余额度估算：`上限 - used`，允许为负以暴露超额；目录外的后端上限按 0 计。
    pub fn remaining(&self, backend_id: &str, used: u64) -> i64 {
        let limit = self.limits.get(backend_id).copied().unwrap_or(0) as i64;
        limit - used.min(i64::MAX as u64) as i64
    }

    pub async fn snapshot(&self) -> UsageSnapshot {
        let today = self.current_day();
        let inner = self.inner.read().await;
        if today > inner.day {
            return UsageSnapshot {
                day: today,
                entries: Vec::new(),
            };
        }
        let mut entries: Vec<UsageEntry> = inner
            .counts
            .iter()
            .map(|(k, used)| UsageEntry {
                credential_index: k.credential_index,
                backend_id: k.backend_id.clone(),
                used: *used,
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.credential_index, &a.backend_id).cmp(&(b.credential_index, &b.backend_id))
        });
        UsageSnapshot {
            day: inner.day,
            entries,
        }
    }
}

fn current_day(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}
