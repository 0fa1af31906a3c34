//! Upstream credential endpoints. Payloads are stored verbatim; the server
//! never inspects them beyond the adapter's own key checks.

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};

use pica_core::retry::ArgError;
use pica_core::sources::SourceKind;

use super::{ApiResult, AppState};

fn parse_source(raw: &str) -> Result<SourceKind, ArgError> {
    SourceKind::from_str(raw).ok_or_else(|| ArgError(format!("unknown source: {raw}")))
}

pub async fn put(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let source = parse_source(&source)?;
    state.scheduler.db().put_auth(source, &payload).await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn get(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<Json<Value>> {
    let source = parse_source(&source)?;
    match state.scheduler.db().get_auth(source).await? {
        Some((_, updated_at)) => Ok(Json(json!({
            "ok": true,
            "exists": true,
            "updatedAt": updated_at,
        }))),
        None => Ok(Json(json!({"ok": true, "exists": false}))),
    }
}
