use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::super::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(serde::Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

pub async fn get_status_endpoint(State(state): State<AppState>) -> axum::response::Response {
    match state.pipeline.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn get_dead_letters_endpoint(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .clamp(1, MAX_DEAD_LETTER_LIMIT);
    match state.pipeline.store.list_dead_letter_archive(limit).await {
        Ok(entries) => Json(serde_json::json!({
            "success": true,
            "count": entries.len(),
            "dead_letters": entries
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}
