//! Protocol error types, status codes and the wire error envelope.

use crate::event::{RpcReference, ServiceCallIdentifier};
use crate::payload::SerializedPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or payload handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'TNDM', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("frame header too large: {size} bytes (max {max})")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Stable status codes carried by protocol-level errors.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    BadRequest,
    NotFound,
    ProtocolViolation,
    StreamTimeout,
    Cancelled,
    InternalError,
    Unavailable,
}

impl StatusCode {
    /// Returns whether a call failing with this status may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::StreamTimeout | StatusCode::InternalError | StatusCode::Unavailable
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::BadRequest => write!(f, "BAD_REQUEST"),
            StatusCode::NotFound => write!(f, "NOT_FOUND"),
            StatusCode::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
            StatusCode::StreamTimeout => write!(f, "STREAM_TIMEOUT"),
            StatusCode::Cancelled => write!(f, "CANCELLED"),
            StatusCode::InternalError => write!(f, "INTERNAL_ERROR"),
            StatusCode::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// A protocol-level error reported by the engine itself rather than by a
/// service implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Stable status code.
    pub status: StatusCode,

    /// Human-readable message.
    pub message: String,

    /// Additional error details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl RpcError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// The peer opened a call that is not registered on this side.
    pub fn unknown_call(reference: RpcReference, call: &ServiceCallIdentifier) -> Self {
        Self::new(
            StatusCode::NotFound,
            format!("unknown call {} for reference <{}>", call, reference),
        )
        .with_detail("reference", reference.as_u64())
        .with_detail("service_id", call.service_id.clone())
        .with_detail("call_id", call.call_id.clone())
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProtocolViolation, message)
    }

    /// The caller did not start an opened stream within the allowed window.
    pub fn stream_timeout(window: Duration) -> Self {
        Self::new(
            StatusCode::StreamTimeout,
            format!("stream was not started within {}ms", window.as_millis()),
        )
        .with_detail("window_ms", window.as_millis() as u64)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }

    /// Encodes this error as a wire error payload.
    pub fn to_payload(&self) -> Result<SerializedPayload, ProtocolError> {
        SerializedPayload::encode(&WireError::<()>::Rpc(self.clone()))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Payload of every `Error` / `Warning` frame and of `Data(Error)` stream events.
///
/// `E` is the application error type declared by the call description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum WireError<E> {
    /// An error declared by the call and raised by its implementation.
    Application(E),
    /// An error raised by the engine.
    Rpc(RpcError),
}

impl<E: Serialize> WireError<E> {
    pub fn to_payload(&self) -> Result<SerializedPayload, ProtocolError> {
        SerializedPayload::encode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_retryable() {
        assert!(StatusCode::StreamTimeout.is_retryable());
        assert!(StatusCode::InternalError.is_retryable());
        assert!(StatusCode::Unavailable.is_retryable());

        assert!(!StatusCode::BadRequest.is_retryable());
        assert!(!StatusCode::NotFound.is_retryable());
        assert!(!StatusCode::ProtocolViolation.is_retryable());
        assert!(!StatusCode::Cancelled.is_retryable());
    }

    #[test]
    fn test_status_code_display_matches_serde() {
        for code in [
            StatusCode::BadRequest,
            StatusCode::NotFound,
            StatusCode::ProtocolViolation,
            StatusCode::StreamTimeout,
            StatusCode::Cancelled,
            StatusCode::InternalError,
            StatusCode::Unavailable,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_unknown_call_details() {
        let call = ServiceCallIdentifier::new("calc", "add");
        let err = RpcError::unknown_call(RpcReference::new(7), &call);
        assert_eq!(err.status, StatusCode::NotFound);
        assert_eq!(err.details["reference"], 7);
        assert_eq!(err.details["service_id"], "calc");
        assert!(err.message.contains("calc/add"));
    }

    #[test]
    fn test_wire_error_shape() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Rejected {
            reason: String,
        }

        let app = WireError::Application(Rejected {
            reason: "nope".into(),
        });
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["kind"], "application");
        assert_eq!(json["error"]["reason"], "nope");

        let internal = WireError::<()>::Rpc(RpcError::internal("boom"));
        let internal = serde_json::to_value(internal).unwrap();
        let rpc: WireError<Rejected> = serde_json::from_value(internal).unwrap();
        assert!(matches!(rpc, WireError::Rpc(e) if e.status == StatusCode::InternalError));
    }

    #[test]
    fn test_stream_timeout_message() {
        let err = RpcError::stream_timeout(Duration::from_secs(60));
        assert_eq!(err.status, StatusCode::StreamTimeout);
        assert!(err.message.contains("60000ms"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc") || msg.contains("ABC"));

        let err = ProtocolError::InvalidFlags(0xFF);
        let msg = err.to_string();
        assert!(msg.contains("ff") || msg.contains("FF"));
    }
}
