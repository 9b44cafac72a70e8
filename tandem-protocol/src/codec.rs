//! Encoder and decoder for frames carried in binary envelopes.

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::frame::RpcFrame;
use bytes::{Bytes, BytesMut};

/// Encodes frames into envelope bytes.
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn encode(frame: &RpcFrame) -> Result<BytesMut, ProtocolError> {
        frame.to_envelope()?.encode()
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(frame: &RpcFrame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        frame.to_envelope()?.encode_into(buf)
    }
}

/// Incrementally decodes frames from a byte stream.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<RpcFrame>, ProtocolError> {
        match Envelope::decode(&mut self.buffer)? {
            Some(envelope) => Ok(Some(RpcFrame::from_envelope(envelope)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
