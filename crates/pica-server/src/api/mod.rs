//! REST control plane under `/api/v1`.

mod auth;
mod config;
mod tasks;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use pica_core::retry::ArgError;
use pica_core::scheduler::{Conflict, NotFound, Scheduler};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    /// When set, every request must carry a matching `X-Api-Key`.
    pub api_key: Option<Arc<str>>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks/download", post(tasks::create))
        .route("/tasks", get(tasks::list))
        .route("/tasks/config", get(config::get_config).put(config::put_config))
        .route("/tasks/:id", get(tasks::get).delete(tasks::delete))
        .route("/tasks/:id/:action", post(tasks::control))
        .route("/auth/:source", put(auth::put).get(auth::get))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state);
    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let matches: bool = provided
            .as_bytes()
            .ct_eq(expected.as_bytes())
            .into();
        if !matches {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid api key"})),
            )
                .into_response();
        }
    }
    next.run(req).await
}

/// Error envelope: maps the engine's typed errors onto REST statuses.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = if let Some(conflict) = self.0.downcast_ref::<Conflict>() {
            (StatusCode::CONFLICT, conflict.0.clone())
        } else if self.0.downcast_ref::<NotFound>().is_some() {
            (StatusCode::NOT_FOUND, "task not found".to_string())
        } else if let Some(arg) = self.0.downcast_ref::<ArgError>() {
            (StatusCode::BAD_REQUEST, arg.to_string())
        } else {
            tracing::error!("internal api error: {:#}", self.0);
            (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
