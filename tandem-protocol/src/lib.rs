//! # tandem-protocol
//!
//! Wire protocol for tandem, a multiplexed streaming RPC engine.
//!
//! This crate provides:
//! - The call-correlated frame model (reference + upstream/downstream event + payload)
//! - Opaque serialized payloads with JSON encoding helpers
//! - Stable status codes and the wire error envelope
//! - Binary envelope framing with length prefix and CRC32C validation

pub mod codec;
pub mod envelope;
pub mod error;
pub mod event;
pub mod frame;
pub mod payload;

pub use codec::{FrameDecoder, FrameEncoder};
pub use envelope::{Envelope, EnvelopeFlags, ENVELOPE_HEADER_SIZE, MAGIC};
pub use error::{ProtocolError, RpcError, StatusCode, WireError};
pub use event::{
    DownstreamEvent, RpcEvent, RpcReference, ServiceCallIdentifier, StreamEventKind,
    StreamOperation, UpstreamEvent,
};
pub use frame::{FrameHeader, RpcFrame};
pub use payload::SerializedPayload;

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for tandem servers.
pub const DEFAULT_PORT: u16 = 7411;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
