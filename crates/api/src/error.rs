use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetwatch_core::error::CoreError;
use serde_json::json;

use crate::gateway::GatewayError;
use crate::metrics::MetricsError;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
/// Device sessions never see this type; they answer with protocol result
/// codes instead.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `fleetwatch_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A store error from the persistence gateway.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The metrics exporter could not render.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(CoreError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }

            // --- Store errors ---
            AppError::Gateway(GatewayError::Timeout(limit)) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Store call timed out");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    "STORE_TIMEOUT",
                    "The store did not respond in time".to_string(),
                )
            }
            AppError::Gateway(GatewayError::Database(err)) => classify_sqlx_error(err),
            AppError::Gateway(GatewayError::Unavailable(msg)) => {
                tracing::error!(error = %msg, "Store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "The store is unavailable".to_string(),
                )
            }

            // --- Metrics export ---
            AppError::Metrics(MetricsError::MissingJobName) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "METRICS_MISCONFIGURED",
                "metrics job name is not configured".to_string(),
            ),
            AppError::Metrics(err) => {
                tracing::error!(error = %err, "Metrics export failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Classify a sqlx error into an HTTP status, error code, and message.
///
/// Pool exhaustion maps to 503; everything else maps to 500 with a
/// sanitized message.
fn classify_sqlx_error(err: &sqlx::Error) -> (StatusCode, &'static str, String) {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            tracing::error!(error = %err, "Database pool unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                "The store is unavailable".to_string(),
            )
        }
        other => {
            tracing::error!(error = %other, "Database error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}
