#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use fleetwatch_api::config::ServerConfig;
use fleetwatch_api::gateway::InMemoryGateway;
use fleetwatch_api::router::build_app_router;
use fleetwatch_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
///
/// No CORS origins (matching the default), a 30-second request timeout and
/// a 30-second keepalive.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: Vec::new(),
        request_timeout_secs: 30,
        shutdown_timeout_secs: 1,
        keepalive_secs: 30,
        store_timeout_secs: 5,
        retention_hours: 72,
        metrics_job_name: "fleetwatch".to_string(),
    }
}

/// Application state over an in-memory store, plus a handle on that store.
pub fn build_test_state(config: ServerConfig) -> (AppState, Arc<InMemoryGateway>) {
    let gateway = Arc::new(InMemoryGateway::new());
    let state = AppState::new(config, gateway.clone()).unwrap();
    (state, gateway)
}

/// The production router and middleware stack over an in-memory store.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub gateway: Arc<InMemoryGateway>,
}

pub fn build_test_app(config: ServerConfig) -> TestApp {
    let (state, gateway) = build_test_state(config.clone());
    let router = build_app_router(state.clone(), &config);
    TestApp {
        router,
        state,
        gateway,
    }
}

/// A running server on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub gateway: Arc<InMemoryGateway>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }
}

pub async fn spawn_server(config: ServerConfig) -> TestServer {
    let app = build_test_app(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.router).await.unwrap();
    });
    TestServer {
        addr,
        state: app.state,
        gateway: app.gateway,
    }
}

/// Issue a GET through the router without a network round trip.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
