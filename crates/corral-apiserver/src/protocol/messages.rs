//! Wire messages.
//!
//! Every frame is a length-prefixed JSON document:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! Clients send [`Request`]s. The server sends [`ServerMessage`]s: call
//! responses correlated by `request_id`, and asynchronous notifications
//! pushed by server-side resources. Both share one outbound stream, so
//! per-connection ordering is preserved.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

use super::error::{ApiError, ErrorBody, MAX_FRAME_SIZE, ProtocolError, ProtocolResult};

/// Builds the frame codec shared by server and clients.
#[must_use]
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// A single RPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// Client-chosen correlation id, echoed in the response.
    pub request_id: u64,

    /// Facade name, e.g. `Admin` or `Client`.
    pub facade: String,

    /// Facade version. Absent means 0.
    #[serde(default)]
    pub version: u32,

    /// Facade instance id. Empty for singleton facades.
    #[serde(default)]
    pub id: String,

    /// Method name.
    pub method: String,

    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Creates a request with no parameters.
    #[must_use]
    pub fn new(request_id: u64, facade: &str, version: u32, method: &str) -> Self {
        Self {
            request_id,
            facade: facade.to_string(),
            version,
            id: String::new(),
            method: method.to_string(),
            params: Value::Null,
        }
    }

    /// Sets the facade instance id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Parses a request frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFrame`] if the frame is not a valid
    /// request document.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(frame).map_err(|e| ProtocolError::InvalidFrame {
            reason: e.to_string(),
        })
    }

    /// Encodes the request into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] on failure.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        encode_json(self)
    }
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to a [`Request`].
    Response {
        /// Correlation id from the request.
        request_id: u64,
        /// Result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// Asynchronous push from a server-side resource.
    Notification {
        /// Facade that owns the resource.
        facade: String,
        /// Resource id within the session.
        resource_id: String,
        /// Notification body.
        payload: Value,
    },
}

impl ServerMessage {
    /// Builds a response from a call outcome.
    #[must_use]
    pub fn response(request_id: u64, outcome: Result<Value, ApiError>) -> Self {
        match outcome {
            Ok(result) => Self::Response {
                request_id,
                result: Some(result),
                error: None,
            },
            Err(err) => Self::Response {
                request_id,
                result: None,
                error: Some(err.to_body()),
            },
        }
    }

    /// Parses a server frame. Used by clients.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFrame`] on malformed input.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(frame).map_err(|e| ProtocolError::InvalidFrame {
            reason: e.to_string(),
        })
    }

    /// Encodes the message into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] on failure.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        encode_json(self)
    }
}

fn encode_json<T: Serialize>(value: &T) -> ProtocolResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Serialization {
            reason: e.to_string(),
        })
}

/// Best-effort extraction of a request id from a frame that failed to parse,
/// so the error response can still be correlated.
#[must_use]
pub fn salvage_request_id(frame: &[u8]) -> u64 {
    serde_json::from_slice::<Value>(frame)
        .ok()
        .and_then(|v| v.get("request_id").and_then(Value::as_u64))
        .unwrap_or(0)
}
