//! Message framing for the profile server wire protocol.
//!
//! Wire format: a 4-byte big-endian length prefix followed by a
//! postcard-encoded `Envelope`. The three conversation tiers (unauthenticated
//! single-request, post-Start, post-Verify authenticated) are a connection
//! state gating which request variants are accepted, not a different frame
//! format.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB), guards against a malicious or broken peer
/// claiming an unbounded length prefix.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Whether the envelope's payload is a request or a response to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
}

/// The unit exchanged over a connection, after length-prefix framing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlates a Response with the Request that produced it.
    pub id: u64,
    pub kind: MessageKind,
    /// postcard-encoded request/response payload, dispatched by the caller.
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn request(id: u64, payload: Vec<u8>) -> Self {
        Envelope { id, kind: MessageKind::Request, payload }
    }

    pub fn response(id: u64, payload: Vec<u8>) -> Self {
        Envelope { id, kind: MessageKind::Response, payload }
    }
}

/// Length-prefixed codec for `Envelope`.
#[derive(Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(length);
        let envelope: Envelope = postcard::from_bytes(&body)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = postcard::to_allocvec(&item)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(body.len()));
        }
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let mut codec = EnvelopeCodec;
        let envelope = Envelope::request(1, vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.kind, envelope.kind);
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut codec = EnvelopeCodec;
        let envelope = Envelope::response(7, vec![9; 100]);
        let mut full = BytesMut::new();
        codec.encode(envelope, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(_))));
    }
}
