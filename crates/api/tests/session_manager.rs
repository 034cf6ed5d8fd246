//! Unit tests for `SessionManager`.
//!
//! These tests exercise the session tracker directly, without performing
//! any HTTP upgrades. They verify add/remove semantics, device binding, and
//! graceful shutdown behaviour including the forced path for sessions that
//! ignore cancellation.

use std::sync::Arc;
use std::time::Duration;

use fleetwatch_api::gateway::InMemoryGateway;
use fleetwatch_api::metrics::{MetricsSink, PrometheusMetrics};
use fleetwatch_api::registry::{DeviceRegistry, OnlineRegistry};
use fleetwatch_api::ws::SessionManager;
use fleetwatch_core::protocol::TelemetrySnapshot;

fn collaborators() -> (OnlineRegistry, PrometheusMetrics) {
    let registry = OnlineRegistry::new(Arc::new(InMemoryGateway::new()));
    let metrics = PrometheusMetrics::new("fleetwatch").unwrap();
    (registry, metrics)
}

// ---------------------------------------------------------------------------
// Test: add() and remove() track the connection count
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_and_remove_track_connection_count() {
    let manager = SessionManager::new();
    assert_eq!(manager.connection_count().await, 0);

    let _token = manager.add("conn-1".to_string()).await;
    let _token = manager.add("conn-2".to_string()).await;
    assert_eq!(manager.connection_count().await, 2);

    manager.remove("conn-1").await;
    assert_eq!(manager.connection_count().await, 1);
}

// ---------------------------------------------------------------------------
// Test: remove() with unknown ID is a no-op
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_unknown_id_is_noop() {
    let manager = SessionManager::new();
    let _token = manager.add("conn-1".to_string()).await;

    assert_eq!(manager.remove("nonexistent").await, None);
    assert_eq!(manager.connection_count().await, 1);
}

// ---------------------------------------------------------------------------
// Test: bind_device() is reported back by remove(), unbind_device() clears it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bound_device_is_returned_on_remove() {
    let manager = SessionManager::new();
    let _token = manager.add("conn-1".to_string()).await;
    let _token = manager.add("conn-2".to_string()).await;

    manager.bind_device("conn-1", "dev-1").await;
    manager.bind_device("conn-2", "dev-2").await;
    manager.unbind_device("conn-2").await;

    assert_eq!(manager.remove("conn-1").await.as_deref(), Some("dev-1"));
    assert_eq!(manager.remove("conn-2").await, None);
}

// ---------------------------------------------------------------------------
// Test: shutdown_all() on an empty manager completes immediately
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_all_with_no_sessions() {
    let manager = SessionManager::new();
    let (registry, metrics) = collaborators();

    let aborted = manager
        .shutdown_all(Duration::from_millis(100), &registry, &metrics)
        .await;
    assert_eq!(aborted, 0);

    // Connections arriving after shutdown start out cancelled.
    assert!(manager.add("conn-1".to_string()).await.is_cancelled());
}

// ---------------------------------------------------------------------------
// Test: shutdown_all() cancels tokens, including ones handed out later
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_cancels_session_tokens() {
    let manager = Arc::new(SessionManager::new());
    let (registry, metrics) = collaborators();

    let token = manager.add("conn-1".to_string()).await;
    assert!(!token.is_cancelled());

    // A well-behaved session leaves as soon as its token fires.
    let session = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            token.cancelled().await;
            manager.remove("conn-1").await;
        })
    };

    let aborted = manager
        .shutdown_all(Duration::from_secs(1), &registry, &metrics)
        .await;
    assert_eq!(aborted, 0);
    session.await.unwrap();

    let late = manager.add("conn-2".to_string()).await;
    assert!(late.is_cancelled());
}

// ---------------------------------------------------------------------------
// Test: sessions that outlive the grace period are aborted and cleaned up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stragglers_are_aborted_and_cleaned_up() {
    let manager = SessionManager::new();
    let (registry, metrics) = collaborators();

    let _token = manager.add("conn-1".to_string()).await;
    let stuck = tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });
    manager.attach("conn-1", stuck.abort_handle()).await;

    registry.mark_online("dev-1").await.unwrap();
    manager.bind_device("conn-1", "dev-1").await;
    let snapshot = TelemetrySnapshot {
        utilization_gpu: 30,
        ..TelemetrySnapshot::default()
    };
    metrics.set_metrics("dev-1", &snapshot).await;

    let aborted = manager
        .shutdown_all(Duration::from_millis(100), &registry, &metrics)
        .await;
    assert_eq!(aborted, 1);

    assert!(stuck.await.unwrap_err().is_cancelled());
    assert!(!registry.is_online("dev-1").await);
    assert!(metrics.snapshot("dev-1").await.is_none());
    assert_eq!(manager.connection_count().await, 0);
}
