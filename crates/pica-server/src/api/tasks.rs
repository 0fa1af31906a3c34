//! Task endpoints: create, list, inspect, control, delete.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use pica_core::retry::ArgError;
use pica_core::sources::SourceKind;
use pica_core::store::{TaskParams, TaskRecord};

use super::{ApiResult, AppState};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    source: String,
    target: String,
    #[serde(default)]
    eps: Option<Vec<u32>>,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "coverUrl", default)]
    cover_url: Option<String>,
}

fn parse_source(raw: &str) -> Result<SourceKind, ArgError> {
    SourceKind::from_str(raw).ok_or_else(|| ArgError(format!("unknown source: {raw}")))
}

fn task_json(task: &TaskRecord, include_params: bool) -> Value {
    let mut v = json!({
        "id": task.id,
        "type": task.task_type,
        "source": task.source.as_str(),
        "target": task.target,
        "status": task.status.as_str(),
        "progress": task.progress,
        "total": task.total,
        "message": task.message,
        "comicId": task.comic_id,
        "createdAt": task.created_at,
        "updatedAt": task.updated_at,
    });
    if include_params {
        v["params"] = serde_json::to_value(&task.params).unwrap_or(Value::Null);
    }
    v
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Json<Value>> {
    let source = parse_source(&req.source)?;
    let params = TaskParams {
        eps: req.eps,
        title: req.title,
        cover_url: req.cover_url,
        extra: Default::default(),
    };
    let task_id = state
        .scheduler
        .create_download_task(source, req.target.trim(), params)
        .await?;
    Ok(Json(json!({"ok": true, "taskId": task_id})))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let tasks = state.scheduler.db().list_tasks(limit).await?;
    let tasks: Vec<Value> = tasks.iter().map(|t| task_json(t, false)).collect();
    Ok(Json(json!({"ok": true, "tasks": tasks})))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = state
        .scheduler
        .db()
        .get_task(&id)
        .await?
        .ok_or(pica_core::scheduler::NotFound)?;
    Ok(Json(json!({"ok": true, "task": task_json(&task, true)})))
}

pub async fn control(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    match action.as_str() {
        "pause" => state.scheduler.pause(&id).await?,
        "resume" => state.scheduler.resume(&id).await?,
        "cancel" => state.scheduler.cancel(&id).await?,
        "retry" => state.scheduler.retry(&id).await?,
        other => return Err(ArgError(format!("unknown action: {other}")).into()),
    }
    Ok(Json(json!({"ok": true})))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.scheduler.delete(&id).await?;
    Ok(Json(json!({"ok": true})))
}
