use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{alerts, events, status};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status::get_status_endpoint))
        .route("/api/dead-letters", get(status::get_dead_letters_endpoint))
        .route("/api/clients", get(alerts::get_clients_endpoint))
        .route("/api/alerts/stream", get(alerts::alert_stream_endpoint))
        .route(
            "/api/notifications/{notification_id}/ack",
            post(alerts::ack_endpoint),
        )
        .route("/api/events", post(events::submit_event_endpoint))
        .route(
            "/api/tasks/{task_id}/frames",
            post(events::add_frame_endpoint),
        )
        .route(
            "/api/tasks/{task_id}/flush",
            post(events::flush_task_endpoint),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use crate::core::pipeline::Pipeline;
    use crate::core::store::NewDeadLetterArchive;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.merge.quick_send_threshold = 1;
        config.merge.minimal_delay_seconds = 0.05;
        config.transport.poll_interval_ms = 10;
        config.compensation.cycle_interval_seconds = 60;
        config.compensation.shutdown_grace_seconds = 1;
        let pipeline = Pipeline::build(config, dir.path()).await.unwrap();
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        let state = AppState {
            pipeline,
            log_tx,
            api_port: 17900,
        };
        (state, dir)
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    fn event_body(level: u8) -> serde_json::Value {
        serde_json::json!({
            "task_id": 5,
            "camera_id": 2,
            "skill_id": "fire",
            "alert_type": "smoke",
            "alert_level": level,
            "camera_name": "Dock",
            "description": "smoke near dock",
            "evidence_ref": "snapshots/5/1.jpg"
        })
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let (state, _dir) = test_state().await;
        let app = build_api_router(state);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get(header::X_FRAME_OPTIONS).unwrap(), "DENY");
        assert!(resp.headers().get(header::CONTENT_SECURITY_POLICY).is_some());
    }

    #[tokio::test]
    async fn status_reports_empty_pipeline() {
        let (state, _dir) = test_state().await;
        let app = build_api_router(state);

        let (status, json) = json_request(app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connected_clients"], 0);
        assert_eq!(json["alerts_archived"], 0);
        assert_eq!(json["merge"]["accepting"], true);
        assert!(json["recent_failures"]["publish"].as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submitted_event_is_published() {
        let (state, _dir) = test_state().await;
        let pipeline = state.pipeline.clone();
        pipeline.start().await.unwrap();
        let app = build_api_router(state);

        let (status, json) =
            json_request(app.clone(), Method::POST, "/api/events", Some(event_body(3))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        let mut enqueued = 0;
        for _ in 0..100 {
            let counts = pipeline.store.count_publish_by_status().await.unwrap();
            enqueued = counts.get("ENQUEUED").copied().unwrap_or(0);
            if enqueued == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(enqueued, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_event_is_rejected() {
        let (state, _dir) = test_state().await;
        let app = build_api_router(state);

        let (status, _) = json_request(
            app,
            Method::POST,
            "/api/events",
            Some(serde_json::json!({ "task_id": "not a number" })),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn events_refused_after_shutdown() {
        let (state, _dir) = test_state().await;
        state.pipeline.shutdown().await;
        let app = build_api_router(state);

        let (status, json) =
            json_request(app, Method::POST, "/api/events", Some(event_body(3))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn ack_for_unknown_notification_is_not_found() {
        let (state, _dir) = test_state().await;
        let app = build_api_router(state);

        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/notifications/missing/ack",
            Some(serde_json::json!({ "client_id": "console" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["outcome"], "not_found");
    }

    #[tokio::test]
    async fn dead_letter_listing_respects_limit() {
        let (state, _dir) = test_state().await;
        for i in 0..3 {
            let message_id = format!("m-{}", i);
            state
                .pipeline
                .store
                .archive_dead_letter(&NewDeadLetterArchive {
                    message_id: Some(&message_id),
                    alert_id: Some("a-1"),
                    reason: "death count 4 reached limit 4",
                    dead_reason: "rejected",
                    death_count: 4,
                    retry_count: 1,
                    first_death_ms: None,
                    payload: "{}",
                })
                .await
                .unwrap();
        }
        let app = build_api_router(state);

        let (status, json) =
            json_request(app, Method::GET, "/api/dead-letters?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 2);
        assert_eq!(json["dead_letters"][0]["message_id"], "m-2");
    }

    #[tokio::test]
    async fn frames_and_flush_endpoints() {
        let (state, _dir) = test_state().await;
        let app = build_api_router(state);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/tasks/5/frames?width=2&height=2")
            .body(Body::from(vec![1u8, 2, 3, 4]))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/tasks/5/frames")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let (status, json) =
            json_request(app, Method::POST, "/api/tasks/5/flush", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["flushed"], 0);
    }

    #[tokio::test]
    async fn stream_registers_client_until_dropped() {
        let (state, _dir) = test_state().await;
        let notifier = state.pipeline.notifier.clone();
        let app = build_api_router(state);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/alerts/stream?client_id=console")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(notifier.connected_count().await, 1);

        let (_, json) = json_request(app, Method::GET, "/api/clients", None).await;
        assert_eq!(json["clients"][0]["client_id"], "console");

        drop(resp);
        let mut remaining = 1;
        for _ in 0..50 {
            remaining = notifier.connected_count().await;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn stream_rejects_disallowed_address() {
        let (state, _dir) = test_state().await;
        let mut config = state.pipeline.config.clone();
        config.notify.ip_allow_list = vec!["10.0.0.9".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::build(config, dir.path()).await.unwrap();
        let state = AppState {
            pipeline: Arc::clone(&pipeline),
            ..state
        };
        let app = build_api_router(state);

        let (status, json) =
            json_request(app, Method::GET, "/api/alerts/stream?client_id=x", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["success"], false);
    }
}
