//! Device identity rules and session timing defaults.
//!
//! Pure functions and constants used by the API server when binding a
//! connection to a device and by the retention job.

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default read deadline for a device connection. Every ping from the
/// device pushes the deadline this far into the future.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default upper bound on a single persistence call.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;

/// Default retention for persisted telemetry records.
pub const DEFAULT_RETENTION_HOURS: i64 = 72;

/// Maximum length of a device identifier, in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a device identifier received in an Online message.
///
/// Rules:
/// - Must not be empty or whitespace only.
/// - Must not exceed `MAX_DEVICE_ID_LEN` bytes.
/// - Must not contain control characters.
pub fn validate_device_id(device_id: &str) -> Result<(), CoreError> {
    if device_id.trim().is_empty() {
        return Err(CoreError::Validation(
            "Device id must not be empty".to_string(),
        ));
    }
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Device id must not exceed {MAX_DEVICE_ID_LEN} bytes"
        )));
    }
    if device_id.chars().any(char::is_control) {
        return Err(CoreError::Validation(
            "Device id must not contain control characters".to_string(),
        ));
    }
    Ok(())
}
