use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;

use crate::state::AppState;
use crate::ws::session::{cleanup_device, Session, SessionServices};

/// GET /websocket -- upgrade a device connection.
///
/// After the upgrade the connection is registered with `SessionManager` and
/// driven by one spawned [`Session`] task until it closes.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let services = SessionServices::from_state(&state);
    ws.on_upgrade(move |socket| handle_socket(socket, services))
}

/// Manage a single device connection after upgrade.
///
///   1. Registers the connection with `SessionManager`.
///   2. Runs the session on its own task so shutdown can abort it.
///   3. Removes the connection once the task ends, cleaning up the bound
///      device if the task panicked before it could do so itself.
async fn handle_socket(socket: WebSocket, services: SessionServices) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "Device connection opened");

    let sessions = Arc::clone(&services.sessions);
    let shutdown = sessions.add(conn_id.clone()).await;

    let session = Session::new(conn_id.clone(), services.clone());
    let task = tokio::spawn(session.run(socket, shutdown));
    sessions.attach(&conn_id, task.abort_handle()).await;

    let outcome = task.await;
    let bound = sessions.remove(&conn_id).await;

    match outcome {
        Ok(state) => {
            tracing::debug!(conn_id = %conn_id, ?state, "Session task finished");
        }
        Err(e) if e.is_panic() => {
            tracing::error!(conn_id = %conn_id, error = %e, "Session task panicked");
            if let Some(device_id) = bound {
                cleanup_device(services.registry.as_ref(), services.sink.as_ref(), &device_id)
                    .await;
            }
        }
        Err(_) => {
            tracing::debug!(conn_id = %conn_id, "Session task aborted");
        }
    }
}
