//! Opaque encoded payloads.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// An encoded value travelling next to a frame header.
///
/// The engine never looks inside; call descriptions decide how values are
/// encoded. The helpers below use JSON.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SerializedPayload(Bytes);

impl SerializedPayload {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Encodes a value as JSON.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Decodes the payload from JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for SerializedPayload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SerializedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 64;
        let shown = &self.0[..self.0.len().min(PREVIEW)];
        match std::str::from_utf8(shown) {
            Ok(text) if self.0.len() > PREVIEW => write!(f, "Payload({:?}..)", text),
            Ok(text) => write!(f, "Payload({:?})", text),
            Err(_) => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}
