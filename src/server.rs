//! HTTP/WebSocket server assembly and startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::db::{DbHandle, MarketDb};
use crate::lifecycle::{LifecycleManager, ProbeConfig, WebhookProbe};
use crate::relay::StatusRelay;
use crate::ws;

/// Configuration for the marketplace server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
    pub probe_interval: Duration,
    pub probe_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            db_path: std::path::PathBuf::from(".agora/market.db"),
            dev_mode: false,
            probe_interval: Duration::from_millis(500),
            probe_attempts: 10,
        }
    }
}

/// Build the full application router with API and WebSocket endpoints.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .route("/ws/deployments/{id}", get(ws::ws_deployment_handler))
        .with_state(state)
}

/// Start the marketplace server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = MarketDb::new(&config.db_path).context("Failed to initialize marketplace database")?;
    let probe_config = ProbeConfig {
        interval: config.probe_interval,
        max_attempts: config.probe_attempts,
    };
    let probe_timeout = config.probe_interval.max(Duration::from_secs(2));

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        relay: Arc::new(StatusRelay::new()),
        lifecycle: LifecycleManager::new(Arc::new(WebhookProbe::new(probe_timeout)), probe_config),
    });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "agora marketplace listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::lifecycle::AlwaysReady;

    fn test_router() -> Router {
        let db = MarketDb::new_in_memory().unwrap();
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            relay: Arc::new(StatusRelay::new()),
            lifecycle: LifecycleManager::new(Arc::new(AlwaysReady), ProbeConfig::default()),
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/deployments")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let deployments: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(deployments.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ws_route_rejects_plain_http() {
        // Without an Upgrade handshake the WebSocket route refuses the request
        let app = test_router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_user_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/users")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "server-test"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let user: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(user["name"], "server-test");
        assert_eq!(user["subscriptionTier"], "free");
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8090);
        assert_eq!(config.db_path, std::path::PathBuf::from(".agora/market.db"));
        assert!(!config.dev_mode);
        assert_eq!(config.probe_attempts, 10);
    }
}
