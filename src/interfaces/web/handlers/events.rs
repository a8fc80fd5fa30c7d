use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::core::merge::DetectionEvent;

use super::super::AppState;

#[derive(serde::Deserialize)]
pub struct SubmitEventRequest {
    #[serde(flatten)]
    event: DetectionEvent,
    #[serde(default)]
    evidence_ref: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct FrameQuery {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

pub async fn submit_event_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<SubmitEventRequest>,
) -> axum::response::Response {
    match state
        .pipeline
        .merge
        .submit(payload.event, payload.evidence_ref)
    {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "success": false, "error": "Pipeline is shutting down" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn add_frame_endpoint(
    Path(task_id): Path<i64>,
    Query(query): Query<FrameQuery>,
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    if body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": "Empty frame" })),
        )
            .into_response();
    }
    match state
        .pipeline
        .merge
        .add_frame(task_id, body.to_vec(), query.width, query.height)
    {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Called when an AI task stops: its open groups are sent now.
pub async fn flush_task_endpoint(
    Path(task_id): Path<i64>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let flushed = state.pipeline.merge.flush_task(task_id).await;
    Json(serde_json::json!({ "success": true, "flushed": flushed }))
}
