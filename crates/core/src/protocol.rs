//! Device wire protocol: envelope framing and per-type sub-messages.
//!
//! Every frame carries one JSON object. The header fields sit at the top
//! level next to an opaque `body`, which holds the base64 encoding of a
//! sub-message whose schema depends on the header's `type` tag:
//!
//! ```text
//! {"version":0,"timestamp":1718000000,"id":7,"type":2,
//!  "pub_key":"","sign":"","body":"eyJwcm9qZWN0Ijoi..."}
//! ```
//!
//! Decoding is two-layered. [`Request::decode`] parses the envelope only;
//! the body is decoded with [`Request::body_as`] once the message type is
//! known and the session has decided the message is acceptable.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol version written into every response header.
pub const PROTOCOL_VERSION: u32 = 0;

/// Message returned with every successful response.
pub const MSG_OK: &str = "ok";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Malformed body for message type {type_tag}: {source}")]
    Body {
        type_tag: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Message types and result codes
// ---------------------------------------------------------------------------

/// The closed set of request kinds a device may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Registers the connection as a device (`type = 1`).
    Online,
    /// Periodic hardware utilization snapshot (`type = 2`).
    MachineInfo,
}

impl MessageType {
    /// Integer tag carried in the envelope header.
    pub fn tag(self) -> u32 {
        match self {
            Self::Online => 1,
            Self::MachineInfo => 2,
        }
    }

    /// Resolve a header tag. Returns `None` for unknown tags.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Online),
            2 => Some(Self::MachineInfo),
            _ => None,
        }
    }
}

/// Numeric result code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    BadParameter,
    ParseFailure,
    /// Reserved for message signing; never produced.
    SignatureFailure,
    DatabaseFailure,
    AlreadyOnline,
    RegistrationRequired,
}

impl ResultCode {
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::BadParameter => 1,
            Self::ParseFailure => 2,
            Self::SignatureFailure => 3,
            Self::DatabaseFailure => 4,
            Self::AlreadyOnline => 5,
            Self::RegistrationRequired => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::BadParameter),
            2 => Some(Self::ParseFailure),
            3 => Some(Self::SignatureFailure),
            4 => Some(Self::DatabaseFailure),
            5 => Some(Self::AlreadyOnline),
            6 => Some(Self::RegistrationRequired),
            _ => None,
        }
    }
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown result code {code}")))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Header shared by requests and responses.
///
/// `pub_key` and `sign` are reserved for message signing and are always
/// empty on the wire today.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub version: u32,
    /// Unix seconds.
    pub timestamp: i64,
    /// Request id, echoed in the response.
    pub id: u64,
    /// Raw message type tag, see [`MessageType`].
    #[serde(rename = "type")]
    pub msg_type: u32,
    #[serde(with = "base64_bytes")]
    pub pub_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub sign: Vec<u8>,
}

impl Header {
    /// Build a request header stamped with the current time.
    pub fn new(id: u64, kind: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            timestamp: chrono::Utc::now().timestamp(),
            id,
            msg_type: kind.tag(),
            ..Self::default()
        }
    }

    /// Build the response header for `request`: same id and type, fresh
    /// timestamp, empty signing fields.
    pub fn reply_to(request: &Header) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            timestamp: chrono::Utc::now().timestamp(),
            id: request.id,
            msg_type: request.msg_type,
            ..Self::default()
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.msg_type)
    }
}

/// An inbound envelope: header plus opaque body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub header: Header,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Request {
    /// Build a request whose body is the JSON encoding of `body`.
    pub fn new<T: Serialize>(id: u64, kind: MessageType, body: &T) -> Result<Self, ProtocolError> {
        let body = serde_json::to_vec(body).map_err(ProtocolError::Encode)?;
        Ok(Self {
            header: Header::new(id, kind),
            body,
        })
    }

    /// Parse the outer envelope of a frame. The body is left undecoded.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(ProtocolError::Envelope)
    }

    /// Decode the body as the sub-message `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.body).map_err(|source| ProtocolError::Body {
            type_tag: self.header.msg_type,
            source,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// An outbound envelope: header, result code, human-readable message, and
/// an optional body (always empty today).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(flatten)]
    pub header: Header,
    pub code: ResultCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(request: &Header) -> Self {
        Self::error(request, ResultCode::Success, MSG_OK)
    }

    pub fn error(request: &Header, code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            header: Header::reply_to(request),
            code,
            message: message.into(),
            body: Vec::new(),
        }
    }

    /// Response to a frame whose envelope could not be decoded. The request
    /// id and type are unknown, so both are zero.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::error(&Header::default(), ResultCode::ParseFailure, message)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(ProtocolError::Envelope)
    }
}

// ---------------------------------------------------------------------------
// Sub-messages
// ---------------------------------------------------------------------------

/// Body of an Online message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineBody {
    #[serde(alias = "device_id")]
    pub node_id: String,
}

/// One model served by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInfo {
    pub model: String,
}

/// Body of a MachineInfo message: one hardware utilization snapshot.
///
/// The device id is not part of the body; it is bound to the session by
/// the preceding Online message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    pub project: String,
    #[serde(deserialize_with = "null_as_default")]
    pub models: Vec<ModelInfo>,
    pub gpu_name: String,
    /// GPU utilization, conventionally percent x 100.
    pub utilization_gpu: i64,
    /// Total GPU memory (MB or MiB, as reported by the device).
    pub memory_total: i64,
    pub memory_used: i64,
}

impl TelemetrySnapshot {
    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.model.clone()).collect()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Byte fields travel as standard base64 strings. `null` decodes as empty.
mod base64_bytes {
    use super::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
        }
    }
}
