//! Error types for the RPC layer.
//!
//! # Error Hierarchy
//!
//! - [`ApiError`]: client-visible failures of a single call. Every variant
//!   has a stable wire code ([`ApiError::code`]) and is sent back verbatim,
//!   except [`ApiError::Internal`], whose detail is logged and replaced by an
//!   opaque message.
//! - [`ProtocolError`]: transport failures. These end the connection and are
//!   never reported to the client.

use std::io;

use corral_core::credentials::{Caveat, Macaroon};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size in bytes (16 MiB).
///
/// Frames whose length prefix exceeds this are rejected before allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Client-visible call failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The credential did not match a stored entity.
    #[error("invalid entity name or password")]
    InvalidCredentials,

    /// The login required an existing record and none was found.
    #[error("entity {tag} not found")]
    EntityNotFound {
        /// The missing entity.
        tag: String,
    },

    /// A macaroon carries a third-party caveat that has not been discharged.
    ///
    /// Recoverable: the client fetches a discharge from the caveat's
    /// location and retries.
    #[error("discharge required for caveat at {location}", location = .caveat.location.as_deref().unwrap_or("<none>"))]
    DischargeRequired {
        /// The undischarged caveat.
        caveat: Caveat,
        /// A freshly minted macaroon to discharge, when the login presented
        /// none.
        macaroon: Option<Box<Macaroon>>,
    },

    /// The requested facade version is not registered.
    #[error("{facade} version {version} is not supported")]
    UnsupportedVersion {
        /// Facade name.
        facade: String,
        /// Requested version.
        version: u32,
    },

    /// The controller is upgrading and the method is not upgrade-safe.
    #[error("upgrade in progress")]
    UpgradeInProgress,

    /// A restore is pending or running and the method is not part of it.
    #[error("restore in progress")]
    RestoreInProgress,

    /// No such (facade, version, method).
    #[error("unknown method {facade}({version}).{method}")]
    UnknownMethod {
        /// Facade name.
        facade: String,
        /// Facade version.
        version: u32,
        /// Method name.
        method: String,
    },

    /// No facade instance exists for the id in this session.
    #[error("unknown id {id:?} for facade {facade}")]
    UnknownId {
        /// Facade name.
        facade: String,
        /// Requested id.
        id: String,
    },

    /// The call was abandoned because the connection is closing.
    #[error("cancelled")]
    Cancelled,

    /// The session already has an authenticated entity.
    #[error("already logged in")]
    AlreadyLoggedIn,

    /// A non-Admin call arrived before a successful login.
    #[error("not logged in")]
    NotLoggedIn,

    /// A machine agent's provisioning nonce did not match.
    #[error("machine {tag} not provisioned")]
    NotProvisioned {
        /// The machine tag.
        tag: String,
    },

    /// The request or its parameters are malformed.
    #[error("bad request: {reason}")]
    BadRequest {
        /// What was wrong.
        reason: String,
    },

    /// An internal fault. The detail is logged, never sent.
    #[error("internal error: {detail}")]
    Internal {
        /// Server-side detail.
        detail: String,
    },
}

impl ApiError {
    /// Creates a bad-request error.
    #[must_use]
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// Returns the stable wire code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid-credentials",
            Self::EntityNotFound { .. } => "entity-not-found",
            Self::DischargeRequired { .. } => "discharge-required",
            Self::UnsupportedVersion { .. } => "unsupported-version",
            Self::UpgradeInProgress => "upgrade-in-progress",
            Self::RestoreInProgress => "restore-in-progress",
            Self::UnknownMethod { .. } => "unknown-method",
            Self::UnknownId { .. } => "unknown-id",
            Self::Cancelled => "cancelled",
            Self::AlreadyLoggedIn => "already-logged-in",
            Self::NotLoggedIn => "not-logged-in",
            Self::NotProvisioned { .. } => "not-provisioned",
            Self::BadRequest { .. } => "bad-request",
            Self::Internal { .. } => "internal",
        }
    }

    /// Builds the error body sent to the client.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            Self::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        let info = match self {
            Self::DischargeRequired { caveat, macaroon } => Some(ErrorInfo {
                caveat: Some(caveat.clone()),
                macaroon: macaroon.clone(),
            }),
            _ => None,
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
            info,
        }
    }
}

/// Wire form of an [`ApiError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured detail for recoverable errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ErrorInfo>,
}

/// Structured detail carried by `discharge-required` errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// The caveat that needs a discharge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<Caveat>,
    /// A macaroon to discharge and present at the next login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaroon: Option<Box<Macaroon>>,
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Frame is not a valid request.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// Serialization of an outbound message failed.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Classifies a codec error.
    #[must_use]
    pub fn from_codec(err: io::Error) -> Self {
        // LengthDelimitedCodec reports oversize frames as InvalidData.
        if err.kind() == io::ErrorKind::InvalidData {
            Self::FrameTooLarge {
                max: MAX_FRAME_SIZE,
            }
        } else {
            Self::Io(err)
        }
    }

    /// Returns `true` for errors caused by a misbehaving peer.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::InvalidFrame { .. })
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
