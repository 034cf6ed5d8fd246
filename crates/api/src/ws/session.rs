//! Per-connection device session.
//!
//! A [`Session`] owns one connection for its whole life. Frames are handled
//! strictly one at a time: decode the envelope, check it against the
//! current state, call the registry / gateway / sink, write one response.
//!
//! ```text
//! Connecting -> AwaitingRegistration -> Registered -> Closing -> Closed
//!                         \________________________/
//!                          read error, deadline, close frame
//! ```
//!
//! The read deadline only moves when the device sends a Ping (or Pong).
//! The server never sends pings of its own.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::Utc;
use fleetwatch_core::device::validate_device_id;
use fleetwatch_core::protocol::{
    MessageType, OnlineBody, Request, ResultCode, Response, TelemetrySnapshot,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::gateway::PersistenceGateway;
use crate::metrics::MetricsSink;
use crate::registry::{DeviceRegistry, RegistryError};
use crate::state::AppState;
use crate::ws::manager::SessionManager;

/// Lifecycle of a device connection. No state is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingRegistration,
    Registered,
    Closing,
    Closed,
}

/// Why a session left its read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The device sent a Close frame.
    ClientClosed,
    ReadError,
    /// No Ping arrived within the keepalive window.
    DeadlineExpired,
    WriteError,
    /// The server is shutting down.
    Shutdown,
    /// The transport ended without a Close frame.
    StreamEnded,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub registry: Arc<dyn DeviceRegistry>,
    pub sink: Arc<dyn MetricsSink>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub sessions: Arc<SessionManager>,
    pub keepalive: Duration,
}

impl SessionServices {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            registry: Arc::clone(&state.registry),
            sink: state.metrics.clone(),
            gateway: Arc::clone(&state.gateway),
            sessions: Arc::clone(&state.sessions),
            keepalive: Duration::from_secs(state.config.keepalive_secs),
        }
    }
}

/// Release a device: mark it offline and drop its gauges.
///
/// Safe to call more than once for the same device.
pub async fn cleanup_device(registry: &dyn DeviceRegistry, sink: &dyn MetricsSink, device_id: &str) {
    if let Err(e) = registry.mark_offline(device_id).await {
        tracing::warn!(device_id, error = %e, "Failed to mark device offline");
    }
    sink.delete_metrics(device_id).await;
}

/// What woke the read loop.
enum Inbound {
    Shutdown,
    Deadline,
    Frame(Option<Result<Message, axum::Error>>),
}

pub struct Session {
    conn_id: String,
    device_id: Option<String>,
    state: SessionState,
    deadline: Instant,
    services: SessionServices,
}

impl Session {
    pub fn new(conn_id: String, services: SessionServices) -> Self {
        Self {
            conn_id,
            device_id: None,
            state: SessionState::Connecting,
            deadline: Instant::now() + services.keepalive,
            services,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The transport upgrade succeeded; start the keepalive window.
    pub fn on_upgraded(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::AwaitingRegistration;
            self.refresh_deadline();
        }
    }

    pub fn refresh_deadline(&mut self) {
        self.deadline = Instant::now() + self.services.keepalive;
    }

    /// Handle one inbound frame and produce exactly one response.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Response {
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    device_id = self.device_id().unwrap_or(""),
                    error = %e,
                    "Failed to parse request envelope"
                );
                return Response::malformed("parse request failed");
            }
        };

        tracing::debug!(
            conn_id = %self.conn_id,
            device_id = self.device_id().unwrap_or(""),
            id = request.header.id,
            msg_type = request.header.msg_type,
            "Request received"
        );

        match request.header.message_type() {
            Some(MessageType::Online) => self.handle_online(&request).await,
            Some(MessageType::MachineInfo) => self.handle_machine_info(&request).await,
            None => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    device_id = self.device_id().unwrap_or(""),
                    msg_type = request.header.msg_type,
                    "Unknown request message type"
                );
                Response::error(
                    &request.header,
                    ResultCode::BadParameter,
                    "unknown request message type",
                )
            }
        }
    }

    async fn handle_online(&mut self, request: &Request) -> Response {
        if let Some(bound) = &self.device_id {
            tracing::warn!(
                conn_id = %self.conn_id,
                device_id = %bound,
                "Repeated Online on a registered session"
            );
            return Response::error(
                &request.header,
                ResultCode::AlreadyOnline,
                "device has been online, repeated requests",
            );
        }

        let body: OnlineBody = match request.body_as() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, error = %e, "Failed to parse online request");
                return Response::error(
                    &request.header,
                    ResultCode::ParseFailure,
                    "parse online request failed",
                );
            }
        };

        if let Err(e) = validate_device_id(&body.node_id) {
            tracing::warn!(conn_id = %self.conn_id, error = %e, "Rejected device id");
            return Response::error(&request.header, ResultCode::BadParameter, e.to_string());
        }

        let device_id = body.node_id;
        // Bind first: if shutdown aborts this task mid-claim, the manager
        // still knows which device to release.
        self.services
            .sessions
            .bind_device(&self.conn_id, &device_id)
            .await;
        let claim = self.services.registry.mark_online(&device_id).await;
        if claim.is_err() {
            self.services.sessions.unbind_device(&self.conn_id).await;
        }

        match claim {
            Ok(()) => {
                tracing::info!(conn_id = %self.conn_id, device_id = %device_id, "Device online");
                self.device_id = Some(device_id);
                self.state = SessionState::Registered;
                Response::ok(&request.header)
            }
            Err(RegistryError::AlreadyOnline(_)) => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    device_id = %device_id,
                    "Device already online on another connection"
                );
                Response::error(
                    &request.header,
                    ResultCode::AlreadyOnline,
                    "device has been online, repeated connection",
                )
            }
            Err(RegistryError::Store(e)) => {
                tracing::error!(
                    conn_id = %self.conn_id,
                    device_id = %device_id,
                    error = %e,
                    "Failed to record device online"
                );
                Response::error(
                    &request.header,
                    ResultCode::DatabaseFailure,
                    "insert online database failed",
                )
            }
        }
    }

    async fn handle_machine_info(&mut self, request: &Request) -> Response {
        let Some(device_id) = self.device_id.clone() else {
            tracing::warn!(conn_id = %self.conn_id, "Machine info before Online");
            return Response::error(
                &request.header,
                ResultCode::RegistrationRequired,
                "node id is empty, need send online device first",
            );
        };

        let snapshot: TelemetrySnapshot = match request.body_as() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    device_id = %device_id,
                    error = %e,
                    "Failed to parse machine info request"
                );
                return Response::error(
                    &request.header,
                    ResultCode::ParseFailure,
                    "parse machine info request failed",
                );
            }
        };

        if let Err(e) = self
            .services
            .gateway
            .append_telemetry(&device_id, Utc::now(), &snapshot)
            .await
        {
            tracing::error!(
                conn_id = %self.conn_id,
                device_id = %device_id,
                error = %e,
                "Failed to persist machine info"
            );
            return Response::error(
                &request.header,
                ResultCode::DatabaseFailure,
                "update database failed",
            );
        }

        self.services.sink.set_metrics(&device_id, &snapshot).await;
        tracing::info!(
            conn_id = %self.conn_id,
            device_id = %device_id,
            utilization_gpu = snapshot.utilization_gpu,
            memory_used = snapshot.memory_used,
            memory_total = snapshot.memory_total,
            "Machine info updated"
        );
        Response::ok(&request.header)
    }

    /// Leave the session. Cleanup runs on the first call only.
    pub async fn close(&mut self, reason: CloseReason) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(device_id) = &self.device_id {
            cleanup_device(
                self.services.registry.as_ref(),
                self.services.sink.as_ref(),
                device_id,
            )
            .await;
        }

        self.state = SessionState::Closed;
        tracing::info!(
            conn_id = %self.conn_id,
            device_id = self.device_id().unwrap_or(""),
            ?reason,
            "Connection stopped"
        );
    }

    /// Drive the connection until it closes. Returns the final state.
    pub async fn run<S>(mut self, mut socket: S, shutdown: CancellationToken) -> SessionState
    where
        S: Stream<Item = Result<Message, axum::Error>> + Sink<Message, Error = axum::Error> + Unpin,
    {
        self.on_upgraded();

        let reason = loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Inbound::Shutdown,
                _ = tokio::time::sleep_until(self.deadline) => Inbound::Deadline,
                frame = socket.next() => Inbound::Frame(frame),
            };

            let payload = match inbound {
                Inbound::Shutdown => {
                    let _ = socket.send(Message::Close(None)).await;
                    break CloseReason::Shutdown;
                }
                Inbound::Deadline => break CloseReason::DeadlineExpired,
                Inbound::Frame(None) => break CloseReason::StreamEnded,
                Inbound::Frame(Some(Err(e))) => {
                    tracing::debug!(conn_id = %self.conn_id, error = %e, "WebSocket receive error");
                    break CloseReason::ReadError;
                }
                Inbound::Frame(Some(Ok(message))) => match message {
                    Message::Close(_) => break CloseReason::ClientClosed,
                    Message::Ping(_) | Message::Pong(_) => {
                        self.refresh_deadline();
                        tracing::trace!(conn_id = %self.conn_id, "Keepalive received");
                        continue;
                    }
                    Message::Text(text) => text.as_str().as_bytes().to_vec(),
                    Message::Binary(bytes) => bytes.to_vec(),
                },
            };

            let response = self.handle_frame(&payload).await;
            let text = match response.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(conn_id = %self.conn_id, error = %e, "Failed to encode response");
                    continue;
                }
            };
            if let Err(e) = socket.send(Message::Text(text.into())).await {
                tracing::debug!(conn_id = %self.conn_id, error = %e, "WebSocket send error");
                break CloseReason::WriteError;
            }
        };

        self.close(reason).await;
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use assert_matches::assert_matches;
    use fleetwatch_core::protocol::{ModelInfo, PROTOCOL_VERSION};
    use futures::channel::mpsc;

    use super::*;
    use crate::gateway::InMemoryGateway;
    use crate::metrics::PrometheusMetrics;
    use crate::registry::OnlineRegistry;

    struct Fixture {
        gateway: Arc<InMemoryGateway>,
        registry: Arc<OnlineRegistry>,
        metrics: Arc<PrometheusMetrics>,
        services: SessionServices,
    }

    fn fixture(keepalive: Duration) -> Fixture {
        let gateway = Arc::new(InMemoryGateway::new());
        let registry = Arc::new(OnlineRegistry::new(gateway.clone()));
        let metrics = Arc::new(PrometheusMetrics::new("fleetwatch").unwrap());
        let services = SessionServices {
            registry: registry.clone(),
            sink: metrics.clone(),
            gateway: gateway.clone(),
            sessions: Arc::new(SessionManager::new()),
            keepalive,
        };
        Fixture {
            gateway,
            registry,
            metrics,
            services,
        }
    }

    fn session(fx: &Fixture) -> Session {
        let mut session = Session::new("conn-1".to_string(), fx.services.clone());
        session.on_upgraded();
        session
    }

    fn online(id: u64, device_id: &str) -> Vec<u8> {
        let body = OnlineBody {
            node_id: device_id.to_string(),
        };
        Request::new(id, MessageType::Online, &body)
            .unwrap()
            .encode()
            .unwrap()
            .into_bytes()
    }

    fn machine_info(id: u64, utilization: i64) -> Vec<u8> {
        let body = TelemetrySnapshot {
            project: "DecentralGPT".to_string(),
            models: vec![ModelInfo {
                model: "Codestral-22B-v0.1".to_string(),
            }],
            gpu_name: "NVIDIA RTX A5000".to_string(),
            utilization_gpu: utilization,
            memory_total: 24564,
            memory_used: 22128,
        };
        Request::new(id, MessageType::MachineInfo, &body)
            .unwrap()
            .encode()
            .unwrap()
            .into_bytes()
    }

    // -- State machine ------------------------------------------------------

    #[tokio::test]
    async fn upgrade_moves_to_awaiting_registration() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = Session::new("conn-1".to_string(), fx.services.clone());
        assert_eq!(session.state(), SessionState::Connecting);
        session.on_upgraded();
        assert_eq!(session.state(), SessionState::AwaitingRegistration);
        assert!(session.deadline() > Instant::now());
    }

    #[tokio::test]
    async fn online_registers_and_binds_device() {
        let fx = fixture(Duration::from_secs(30));
        let _token = fx.services.sessions.add("conn-1".to_string()).await;
        let mut session = session(&fx);

        let response = session.handle_frame(&online(0, "dev-1")).await;
        assert_eq!(response.code, ResultCode::Success);
        assert_eq!(response.header.id, 0);
        assert_eq!(response.header.msg_type, 1);
        assert_eq!(response.header.version, PROTOCOL_VERSION);
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.device_id(), Some("dev-1"));
        assert!(fx.registry.is_online("dev-1").await);
        assert_eq!(
            fx.services.sessions.remove("conn-1").await.as_deref(),
            Some("dev-1")
        );
    }

    #[tokio::test]
    async fn machine_info_before_online_is_rejected() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);

        let response = session.handle_frame(&machine_info(3, 30)).await;
        assert_eq!(response.code, ResultCode::RegistrationRequired);
        assert_eq!(response.header.id, 3);
        assert_eq!(response.header.msg_type, 2);
        assert_eq!(session.state(), SessionState::AwaitingRegistration);
        assert_eq!(fx.gateway.telemetry_count().await, 0);
        assert_eq!(fx.metrics.device_count().await, 0);
    }

    #[tokio::test]
    async fn machine_info_persists_and_updates_metrics() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);
        session.handle_frame(&online(0, "dev-1")).await;

        let response = session.handle_frame(&machine_info(1, 30)).await;
        assert_eq!(response.code, ResultCode::Success);
        assert_eq!(response.header.id, 1);
        assert_eq!(response.header.msg_type, 2);

        let rows = fx.gateway.telemetry_for("dev-1").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].utilization_gpu, 30);
        assert_eq!(fx.metrics.snapshot("dev-1").await.unwrap().utilization_gpu, 30);
    }

    #[tokio::test]
    async fn repeated_online_on_registered_session_is_rejected() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);
        session.handle_frame(&online(0, "dev-1")).await;

        let response = session.handle_frame(&online(1, "dev-9")).await;
        assert_eq!(response.code, ResultCode::AlreadyOnline);
        assert_eq!(session.device_id(), Some("dev-1"));
        assert!(!fx.registry.is_online("dev-9").await);
    }

    #[tokio::test]
    async fn online_for_device_held_elsewhere_is_rejected() {
        let fx = fixture(Duration::from_secs(30));
        let mut first = session(&fx);
        let _token = fx.services.sessions.add("conn-2".to_string()).await;
        let mut second = Session::new("conn-2".to_string(), fx.services.clone());
        second.on_upgraded();

        assert_eq!(first.handle_frame(&online(0, "dev-2")).await.code, ResultCode::Success);
        let response = second.handle_frame(&online(0, "dev-2")).await;
        assert_eq!(response.code, ResultCode::AlreadyOnline);
        assert_eq!(second.state(), SessionState::AwaitingRegistration);
        assert_eq!(second.device_id(), None);
        assert_eq!(fx.services.sessions.remove("conn-2").await, None);

        // The rejected session must not release the other session's claim.
        second.close(CloseReason::ClientClosed).await;
        assert!(fx.registry.is_online("dev-2").await);
    }

    #[tokio::test]
    async fn empty_device_id_is_a_bad_parameter() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);

        let response = session.handle_frame(&online(4, "  ")).await;
        assert_eq!(response.code, ResultCode::BadParameter);
        assert_eq!(session.state(), SessionState::AwaitingRegistration);
    }

    #[tokio::test]
    async fn malformed_envelope_yields_zeroed_parse_error() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);

        let response = session.handle_frame(b"{not json").await;
        assert_eq!(response.code, ResultCode::ParseFailure);
        assert_eq!(response.header.id, 0);
        assert_eq!(response.header.msg_type, 0);
        assert_eq!(session.state(), SessionState::AwaitingRegistration);
    }

    #[tokio::test]
    async fn malformed_body_keeps_session_registered() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);
        session.handle_frame(&online(0, "dev-1")).await;

        // Body is valid base64 of something that is not a snapshot.
        let frame = br#"{"id":5,"type":2,"body":"WzEsMiwzXQ=="}"#;
        let response = session.handle_frame(frame).await;
        assert_eq!(response.code, ResultCode::ParseFailure);
        assert_eq!(response.header.id, 5);
        assert_eq!(response.header.msg_type, 2);
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(fx.gateway.telemetry_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_message_type_is_a_bad_parameter() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);

        let response = session.handle_frame(br#"{"id":9,"type":42}"#).await;
        assert_eq!(response.code, ResultCode::BadParameter);
        assert_eq!(response.header.id, 9);
        assert_eq!(response.header.msg_type, 42);
    }

    #[tokio::test]
    async fn store_failure_is_reported_and_skips_metrics() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);
        session.handle_frame(&online(0, "dev-1")).await;
        fx.gateway.set_failing(true);

        let response = session.handle_frame(&machine_info(1, 30)).await;
        assert_eq!(response.code, ResultCode::DatabaseFailure);
        assert_eq!(session.state(), SessionState::Registered);
        assert!(fx.metrics.snapshot("dev-1").await.is_none());
    }

    #[tokio::test]
    async fn failed_claim_leaves_connection_unbound() {
        let fx = fixture(Duration::from_secs(30));
        let _token = fx.services.sessions.add("conn-1".to_string()).await;
        let mut session = session(&fx);
        fx.gateway.set_failing(true);

        let response = session.handle_frame(&online(0, "dev-1")).await;
        assert_eq!(response.code, ResultCode::DatabaseFailure);
        assert_eq!(fx.services.sessions.remove("conn-1").await, None);
    }

    #[tokio::test]
    async fn session_aborted_mid_claim_is_released_on_shutdown() {
        let fx = fixture(Duration::from_secs(30));
        let sessions = Arc::clone(&fx.services.sessions);
        let _token = sessions.add("conn-1".to_string()).await;
        // Hold the durable write open so the abort lands inside the claim.
        fx.gateway.set_latency(Duration::from_millis(300)).await;

        let mut session = session(&fx);
        let task = tokio::spawn(async move { session.handle_frame(&online(0, "dev-1")).await });
        sessions.attach("conn-1", task.abort_handle()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.registry.is_online("dev-1").await);

        fx.gateway.set_latency(Duration::ZERO).await;
        let aborted = sessions
            .shutdown_all(
                Duration::from_millis(20),
                fx.registry.as_ref(),
                fx.metrics.as_ref(),
            )
            .await;
        assert_eq!(aborted, 1);
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!fx.registry.is_online("dev-1").await);
        assert!(fx.gateway.online_ids().await.is_empty());
    }

    #[tokio::test]
    async fn close_cleans_up_exactly_once() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);
        session.handle_frame(&online(0, "dev-1")).await;
        session.handle_frame(&machine_info(1, 30)).await;

        session.close(CloseReason::ClientClosed).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!fx.registry.is_online("dev-1").await);
        assert!(fx.metrics.snapshot("dev-1").await.is_none());

        // Another session takes the id; a second close must not release it.
        let mut other = Session::new("conn-2".to_string(), fx.services.clone());
        other.on_upgraded();
        other.handle_frame(&online(0, "dev-1")).await;
        session.close(CloseReason::ReadError).await;
        assert!(fx.registry.is_online("dev-1").await);
    }

    #[tokio::test]
    async fn close_without_registration_is_a_no_op() {
        let fx = fixture(Duration::from_secs(30));
        let mut session = session(&fx);
        session.close(CloseReason::DeadlineExpired).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(fx.registry.online_devices().await.is_empty());
    }

    // -- Read loop ----------------------------------------------------------

    /// In-process socket: frames pushed into `inbound` are read by the
    /// session, frames the session sends land in `outbound`.
    struct MockSocket {
        inbound: mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
        outbound: mpsc::UnboundedSender<Message>,
    }

    impl Stream for MockSocket {
        type Item = Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_next_unpin(cx)
        }
    }

    impl Sink<Message> for MockSocket {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.outbound.unbounded_send(item).map_err(axum::Error::new)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    type Client = (
        mpsc::UnboundedSender<Result<Message, axum::Error>>,
        mpsc::UnboundedReceiver<Message>,
    );

    fn mock_socket() -> (MockSocket, Client) {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        (
            MockSocket {
                inbound: in_rx,
                outbound: out_tx,
            },
            (in_tx, out_rx),
        )
    }

    fn text(frame: Vec<u8>) -> Result<Message, axum::Error> {
        Ok(Message::Text(String::from_utf8(frame).unwrap().into()))
    }

    async fn next_response(rx: &mut mpsc::UnboundedReceiver<Message>) -> Response {
        match rx.next().await {
            Some(Message::Text(text)) => Response::decode(text.as_str().as_bytes()).unwrap(),
            other => panic!("expected a text response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_answers_frames_and_cleans_up_on_close_frame() {
        let fx = fixture(Duration::from_secs(30));
        let (socket, (tx, mut rx)) = mock_socket();
        let session = Session::new("conn-1".to_string(), fx.services.clone());
        let task = tokio::spawn(session.run(socket, CancellationToken::new()));

        tx.unbounded_send(text(online(0, "dev-1"))).unwrap();
        assert_eq!(next_response(&mut rx).await.code, ResultCode::Success);

        tx.unbounded_send(Ok(Message::Binary(machine_info(1, 30).into()))).unwrap();
        let response = next_response(&mut rx).await;
        assert_eq!(response.code, ResultCode::Success);
        assert_eq!(response.header.id, 1);
        assert_eq!(fx.metrics.snapshot("dev-1").await.unwrap().utilization_gpu, 30);

        tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), SessionState::Closed);
        assert!(!fx.registry.is_online("dev-1").await);
        assert!(fx.metrics.snapshot("dev-1").await.is_none());
    }

    #[tokio::test]
    async fn run_closes_when_no_ping_arrives() {
        let fx = fixture(Duration::from_millis(100));
        let (socket, (tx, mut rx)) = mock_socket();
        let session = Session::new("conn-1".to_string(), fx.services.clone());
        let task = tokio::spawn(session.run(socket, CancellationToken::new()));

        tx.unbounded_send(text(online(0, "dev-1"))).unwrap();
        assert_eq!(next_response(&mut rx).await.code, ResultCode::Success);

        let state = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should expire")
            .unwrap();
        assert_eq!(state, SessionState::Closed);
        assert!(!fx.registry.is_online("dev-1").await);
        drop(tx);
    }

    #[tokio::test]
    async fn run_pings_extend_the_deadline() {
        let fx = fixture(Duration::from_millis(150));
        let (socket, (tx, _rx)) = mock_socket();
        let session = Session::new("conn-1".to_string(), fx.services.clone());
        let task = tokio::spawn(session.run(socket, CancellationToken::new()));

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.unbounded_send(Ok(Message::Ping(Vec::new().into()))).unwrap();
        }
        assert!(!task.is_finished(), "pings must keep the session alive");

        tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn run_pongs_also_extend_the_deadline() {
        let fx = fixture(Duration::from_millis(150));
        let (socket, (tx, _rx)) = mock_socket();
        let session = Session::new("conn-1".to_string(), fx.services.clone());
        let task = tokio::spawn(session.run(socket, CancellationToken::new()));

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.unbounded_send(Ok(Message::Pong(Vec::new().into()))).unwrap();
        }
        assert!(!task.is_finished(), "pongs must keep the session alive");

        tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn run_sends_close_frame_on_shutdown() {
        let fx = fixture(Duration::from_secs(30));
        let (socket, (tx, mut rx)) = mock_socket();
        let shutdown = CancellationToken::new();
        let session = Session::new("conn-1".to_string(), fx.services.clone());
        let task = tokio::spawn(session.run(socket, shutdown.clone()));

        tx.unbounded_send(text(online(0, "dev-1"))).unwrap();
        next_response(&mut rx).await;

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), SessionState::Closed);
        assert_matches!(rx.next().await, Some(Message::Close(None)));
        assert!(!fx.registry.is_online("dev-1").await);
    }

    #[tokio::test]
    async fn run_treats_read_error_as_transport_failure() {
        let fx = fixture(Duration::from_secs(30));
        let (socket, (tx, mut rx)) = mock_socket();
        let session = Session::new("conn-1".to_string(), fx.services.clone());
        let task = tokio::spawn(session.run(socket, CancellationToken::new()));

        tx.unbounded_send(text(online(0, "dev-1"))).unwrap();
        next_response(&mut rx).await;

        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        tx.unbounded_send(Err(axum::Error::new(err))).unwrap();
        assert_eq!(task.await.unwrap(), SessionState::Closed);
        assert!(!fx.registry.is_online("dev-1").await);
    }
}
