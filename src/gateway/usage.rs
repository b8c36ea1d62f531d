use super::AppState;
use crate::catalog::BackendDescriptor;
use crate::dispatch::Upstream;
use axum::Json;
use axum::extract::State;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct UsageView {
    pub day: NaiveDate,
    pub credentials: usize,
    pub entries: Vec<UsageRow>,
}

/// 每个（凭据, 后端）组合一行，包括尚未使用过的组合。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRow {
    pub credential: String,
    pub credential_index: usize,
    pub backend: String,
    pub used: u64,
    pub daily_limit: u32,
    pub remaining: i64,
}

pub async fn handle_models<U: Upstream + 'static>(
    State(state): State<Arc<AppState<U>>>,
) -> Json<Vec<BackendDescriptor>> {
    Json(state.engine.catalog().backends().to_vec())
}

pub async fn handle_usage<U: Upstream + 'static>(
    State(state): State<Arc<AppState<U>>>,
) -> Json<UsageView> {
    let engine = &state.engine;
    let usage = engine.usage();
    let snapshot = usage.snapshot().await;

    let counts: HashMap<(usize, &str), u64> = snapshot
        .entries
        .iter()
        .map(|e| ((e.credential_index, e.backend_id.as_str()), e.used))
        .collect();

    let mut entries = Vec::with_capacity(engine.pool().len() * engine.catalog().len());
    for cred in engine.pool().iter() {
        for backend in engine.catalog().backends() {
            let used = counts
                .get(&(cred.index, backend.id.as_str()))
                .copied()
                .unwrap_or(0);
            entries.push(UsageRow {
                credential: cred.masked(),
                credential_index: cred.index,
                backend: backend.id.clone(),
                used,
                daily_limit: backend.daily_limit,
                remaining: usage.remaining(&backend.id, used),
            });
        }
    }

    Json(UsageView {
        day: snapshot.day,
        credentials: engine.pool().len(),
        entries,
    })
}
