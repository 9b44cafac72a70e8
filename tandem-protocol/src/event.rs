//! Call references and the events carried in frame headers.
//!
//! Upstream events flow from the caller to the callee, downstream events flow
//! back. The accompanying payload (request, item, response or error) travels
//! next to the header and is never interpreted here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection-scoped identifier of one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcReference(u64);

impl RpcReference {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RpcReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one call of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceCallIdentifier {
    pub service_id: String,
    pub call_id: String,
}

impl ServiceCallIdentifier {
    pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for ServiceCallIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.call_id)
    }
}

/// Kind of a stream `Data` event. `Next` carries an item, `Error` carries a
/// wire error, `Complete` carries nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Next,
    Complete,
    Error,
}

/// Flow control for cold streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOperation {
    /// The consumer is ready; the producer may start emitting.
    Start,
    /// The consumer is done; the producer must stop.
    Close,
}

/// Events sent by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamEvent {
    /// Starts a call. The payload is the encoded request.
    Open { call: ServiceCallIdentifier },
    /// One event of the caller-produced stream.
    Data { event: StreamEventKind },
    /// Flow control for the callee-produced stream.
    StreamOperation { operation: StreamOperation },
    /// Non-fatal condition. The payload is a wire error.
    Warning,
    /// Fatal condition for this call. The payload is a wire error.
    Error,
    /// The caller abandoned the call. The payload is an optional reason.
    Cancel,
}

/// Events sent by the callee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownstreamEvent {
    /// The callee-produced stream exists and waits for `Start`.
    Opened,
    /// One event of the callee-produced stream.
    Data { event: StreamEventKind },
    /// The call's single response. The payload is the encoded response.
    Response,
    /// Flow control for the caller-produced stream.
    StreamOperation { operation: StreamOperation },
    Warning,
    Error,
}

/// Either direction of event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "event", rename_all = "snake_case")]
pub enum RpcEvent {
    Upstream(UpstreamEvent),
    Downstream(DownstreamEvent),
}

impl RpcEvent {
    pub fn is_upstream(&self) -> bool {
        matches!(self, RpcEvent::Upstream(_))
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            RpcEvent::Upstream(event) => match event {
                UpstreamEvent::Open { .. } => "Upstream.Open",
                UpstreamEvent::Data { .. } => "Upstream.Data",
                UpstreamEvent::StreamOperation { .. } => "Upstream.StreamOperation",
                UpstreamEvent::Warning => "Upstream.Warning",
                UpstreamEvent::Error => "Upstream.Error",
                UpstreamEvent::Cancel => "Upstream.Cancel",
            },
            RpcEvent::Downstream(event) => match event {
                DownstreamEvent::Opened => "Downstream.Opened",
                DownstreamEvent::Data { .. } => "Downstream.Data",
                DownstreamEvent::Response => "Downstream.Response",
                DownstreamEvent::StreamOperation { .. } => "Downstream.StreamOperation",
                DownstreamEvent::Warning => "Downstream.Warning",
                DownstreamEvent::Error => "Downstream.Error",
            },
        }
    }
}

impl From<UpstreamEvent> for RpcEvent {
    fn from(event: UpstreamEvent) -> Self {
        RpcEvent::Upstream(event)
    }
}

impl From<DownstreamEvent> for RpcEvent {
    fn from(event: DownstreamEvent) -> Self {
        RpcEvent::Downstream(event)
    }
}

impl fmt::Display for RpcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
