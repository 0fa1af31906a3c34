//! Runtime policy endpoints: worker ceiling and default file concurrency.

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiResult, AppState};

pub async fn get_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let policy = state.scheduler.policy();
    Ok(Json(json!({
        "ok": true,
        "maxConcurrent": policy.max_concurrent,
        "fileConcurrent": policy.file_concurrent_default,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "maxConcurrent", default)]
    max_concurrent: Option<usize>,
    #[serde(rename = "fileConcurrent", default)]
    file_concurrent: Option<usize>,
}

/// Swaps the whole policy record; values are clamped by the engine.
pub async fn put_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<Json<Value>> {
    let policy = state
        .scheduler
        .update_policy(update.max_concurrent, update.file_concurrent);
    Ok(Json(json!({
        "ok": true,
        "maxConcurrent": policy.max_concurrent,
        "fileConcurrent": policy.file_concurrent_default,
    })))
}
