//! The call-correlated frame: header (reference + event) plus payload.

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::event::{DownstreamEvent, RpcEvent, RpcReference, UpstreamEvent};
use crate::payload::SerializedPayload;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Routing information of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub reference: RpcReference,
    #[serde(flatten)]
    pub event: RpcEvent,
}

/// One message of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFrame {
    pub header: FrameHeader,
    pub payload: SerializedPayload,
}

impl RpcFrame {
    pub fn new(reference: RpcReference, event: RpcEvent, payload: SerializedPayload) -> Self {
        Self {
            header: FrameHeader { reference, event },
            payload,
        }
    }

    pub fn upstream(
        reference: RpcReference,
        event: UpstreamEvent,
        payload: SerializedPayload,
    ) -> Self {
        Self::new(reference, RpcEvent::Upstream(event), payload)
    }

    pub fn downstream(
        reference: RpcReference,
        event: DownstreamEvent,
        payload: SerializedPayload,
    ) -> Self {
        Self::new(reference, RpcEvent::Downstream(event), payload)
    }

    /// Builds an outgoing frame, encoding `value` as its payload.
    pub fn encoding<T: Serialize + ?Sized>(
        reference: RpcReference,
        event: impl Into<RpcEvent>,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(reference, event.into(), SerializedPayload::encode(value)?))
    }

    /// Decodes the payload of an incoming frame.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        self.payload.decode()
    }

    pub fn reference(&self) -> RpcReference {
        self.header.reference
    }

    pub fn event(&self) -> &RpcEvent {
        &self.header.event
    }

    /// Wraps the frame into a binary envelope.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let header = serde_json::to_vec(&self.header)?;
        Ok(Envelope::new(
            Bytes::from(header),
            self.payload.as_bytes().clone(),
        ))
    }

    /// Restores a frame from a binary envelope.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let header: FrameHeader = serde_json::from_slice(&envelope.header)?;
        Ok(Self {
            header,
            payload: SerializedPayload::new(envelope.payload),
        })
    }
}
