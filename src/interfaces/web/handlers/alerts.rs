use axum::{
    Json,
    extract::{ConnectInfo, Path, Query, State},
    http::{Extensions, HeaderMap, StatusCode, header},
    response::IntoResponse,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::core::notify::{ClientMeta, NotificationManager, SseFrame};
use crate::core::store::types::AckOutcome;

use super::super::AppState;

#[derive(serde::Deserialize)]
pub struct StreamQuery {
    client_id: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct AckRequest {
    client_id: String,
}

/// Unregisters the connection when axum drops the response stream.
struct StreamGuard {
    notifier: Arc<NotificationManager>,
    connection_id: String,
    client_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let notifier = self.notifier.clone();
        let connection_id = std::mem::take(&mut self.connection_id);
        let client_id = std::mem::take(&mut self.client_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                notifier.unregister(&connection_id, &client_id).await;
            });
        }
    }
}

fn client_ip(extensions: &Extensions) -> String {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn sse_event(frame: SseFrame) -> Event {
    match frame {
        SseFrame::Data(body) => Event::default().data(body),
        SseFrame::Heartbeat => Event::default().comment("heartbeat"),
    }
}

pub async fn alert_stream_endpoint(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    extensions: Extensions,
) -> axum::response::Response {
    let client_id = query
        .client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()));
    let meta = ClientMeta {
        client_id,
        ip: client_ip(&extensions),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let notifier = state.pipeline.notifier.clone();
    match notifier.register(meta).await {
        Ok(handle) => {
            debug!("Opening alert stream {}", handle.connection_id);
            let guard = StreamGuard {
                notifier: notifier.clone(),
                connection_id: handle.connection_id,
                client_id: handle.client_id,
            };
            let stream =
                tokio_stream::wrappers::ReceiverStream::new(handle.receiver).map(move |frame| {
                    let _ = &guard;
                    Ok::<_, Infallible>(sse_event(frame))
                });
            Sse::new(stream).into_response()
        }
        Err(e) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn ack_endpoint(
    Path(notification_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<AckRequest>,
) -> axum::response::Response {
    match state
        .pipeline
        .notifier
        .acknowledge(&notification_id, &payload.client_id)
        .await
    {
        Ok(AckOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "outcome": AckOutcome::NotFound,
                "error": "Notification not found for this client"
            })),
        )
            .into_response(),
        Ok(outcome) => Json(serde_json::json!({
            "success": true,
            "outcome": outcome
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn get_clients_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let clients = state.pipeline.notifier.clients().await;
    Json(serde_json::json!({ "success": true, "clients": clients }))
}
