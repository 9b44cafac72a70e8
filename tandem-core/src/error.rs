//! Core error types.

use serde::de::DeserializeOwned;
use tandem_protocol::{ProtocolError, RpcError, SerializedPayload, StatusCode, WireError};
use thiserror::Error;

/// Errors raised by a connection implementation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Structurally inconsistent service descriptions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptionError {
    #[error("duplicate call '{call_id}' in service '{service_id}'")]
    DuplicateCall { service_id: String, call_id: String },

    #[error("call '{call_id}' belongs to service '{found}', not '{expected}'")]
    ServiceMismatch {
        expected: String,
        found: String,
        call_id: String,
    },

    #[error("service id must not be empty")]
    EmptyServiceId,
}

/// Errors from building or running an RPC node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("service '{0}' is provided by more than one extension")]
    DuplicateService(String),

    #[error("invalid provided service: {0}")]
    Description(#[from] DescriptionError),

    #[error("node is closed")]
    Closed,
}

/// Errors from the session context extension.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not bound to a node")]
    NotBound,

    #[error("context update gave up after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    #[error("context update call failed: {0}")]
    Call(CallError<()>),

    #[error("invalid value for context key '{key}': {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Untyped failure of a call as seen by the caller side of the engine.
///
/// `Remote` still holds the encoded wire error; it is decoded once the
/// expected application error type is known.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    Remote(SerializedPayload),
    Cancelled,
    ProtocolViolation(String),
    ConnectionClosed,
}

impl CallFailure {
    /// Decodes the failure against the call's declared application error type.
    pub fn into_call_error<E: DeserializeOwned>(self) -> CallError<E> {
        match self {
            CallFailure::Remote(payload) => match payload.decode::<WireError<E>>() {
                Ok(WireError::Application(error)) => CallError::Application(error),
                Ok(WireError::Rpc(error)) => match error.status {
                    StatusCode::StreamTimeout => CallError::StreamTimeout(error),
                    StatusCode::Cancelled => CallError::Cancelled,
                    _ => CallError::Remote(error),
                },
                Err(e) => CallError::Codec(format!("undecodable error payload: {}", e)),
            },
            CallFailure::Cancelled => CallError::Cancelled,
            CallFailure::ProtocolViolation(message) => CallError::ProtocolViolation(message),
            CallFailure::ConnectionClosed => CallError::ConnectionClosed,
        }
    }
}

/// Typed failure of a call as seen by application code.
///
/// Callers observe exactly one of: the result, a declared application error,
/// a cancellation, or a protocol-level failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError<E> {
    #[error("application error: {0:?}")]
    Application(E),

    #[error("remote error: {0}")]
    Remote(RpcError),

    #[error("stream start timeout: {0}")]
    StreamTimeout(RpcError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("codec error: {0}")]
    Codec(String),
}

impl<E> CallError<E> {
    /// Returns the application error, if this is one.
    pub fn application(&self) -> Option<&E> {
        match self {
            CallError::Application(error) => Some(error),
            _ => None,
        }
    }

    /// Returns the status code for engine-level failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CallError::Application(_) => None,
            CallError::Remote(error) | CallError::StreamTimeout(error) => Some(error.status),
            CallError::ProtocolViolation(_) => Some(StatusCode::ProtocolViolation),
            CallError::Cancelled => Some(StatusCode::Cancelled),
            CallError::ConnectionClosed => Some(StatusCode::Unavailable),
            CallError::Codec(_) => Some(StatusCode::BadRequest),
        }
    }

    /// Returns whether the call may be retried.
    pub fn is_retryable(&self) -> bool {
        self.status().is_some_and(|status| status.is_retryable())
    }
}
