//! API route definitions
//!
//! - `POST /api/v1/command` — submit a command for a shuttle
//! - `POST /api/v1/command/{id}/cancel` — best-effort cancellation
//! - `GET  /api/v1/shuttles` / `GET /api/v1/shuttles/{id}` — state records
//! - `POST /api/v1/stocks/move` — remap a shuttle to another stock
//! - `GET  /api/v1/metrics` — gateway counters/gauges snapshot

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, GatewayApiState};

/// Create all API routes.
pub fn api_routes(state: GatewayApiState) -> Router {
    Router::new()
        .route("/command", post(handlers::submit_command))
        .route("/command/:id/cancel", post(handlers::cancel_command))
        .route("/shuttles", get(handlers::list_shuttles))
        .route("/shuttles/:id", get(handlers::get_shuttle))
        .route("/stocks/move", post(handlers::move_shuttle_stock))
        .route("/metrics", get(handlers::get_metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, ShuttleEndpoint};
    use crate::dispatch::{CommandRegistry, Dispatcher, RetryPolicy};
    use crate::metrics::GatewayMetrics;
    use crate::store::{MemoryStateStore, StateStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_state() -> GatewayApiState {
        let mut shuttles = HashMap::new();
        shuttles.insert(
            "s1".to_string(),
            ShuttleEndpoint {
                host: "127.0.0.1".to_string(),
                command_port: 1,
            },
        );
        let settings = Arc::new(Settings::with_shuttles(shuttles));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store.init_if_absent("s1").unwrap();
        let metrics = Arc::new(GatewayMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&settings),
            Arc::clone(&store),
            Arc::new(CommandRegistry::new()),
            Arc::clone(&metrics),
            RetryPolicy::default(),
        ));
        GatewayApiState {
            settings,
            store,
            dispatcher,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_list_shuttles_route() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/shuttles")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_shuttle_not_found() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/shuttles/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_command_unknown_shuttle_is_404() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/command")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"shuttle_id": "ghost", "command": "PALLET_IN"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_command_bad_params_is_400() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/command")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"shuttle_id": "s1", "command": "FIFO", "params": "abc"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queued_command_returns_id() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/command")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"shuttle_id": "s1", "command": "PALLET_IN", "external_id": "E1"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["status"], "queued");
        assert!(v["command_id"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_unknown_command_is_404() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/command/no-such/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let app = api_routes(create_test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
