// src/core/control/codec.rs

//! The length-prefixed framing codec for the manager control channel: a
//! 2-byte little-endian length followed by that many payload bytes, the
//! first payload byte being a tag. Implemented as a `tokio_util::codec`
//! `Encoder`/`Decoder` pair, the same way this codebase frames its other
//! binary wire protocol.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{decode_payload, ControlFrame, OutboundFrame};

/// Frames longer than this are a protocol error (§4.5 backpressure &
/// timeouts: reads use a bounded 4 KiB scratch).
const MAX_FRAME_LEN: usize = 4096;

#[derive(Debug, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let length = u16::from_le_bytes([src[0], src[1]]) as usize;
        if length == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "zero-length control frame header",
            ));
        }
        if length > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("control frame of {length} bytes exceeds the {MAX_FRAME_LEN}-byte scratch buffer"),
            ));
        }
        if src.len() < 2 + length {
            src.reserve(2 + length - src.len());
            return Ok(None);
        }

        src.advance(2);
        let payload = src.split_to(length);

        decode_payload(&payload)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<OutboundFrame> for ControlCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        let length: u16 = payload
            .len()
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "outbound frame too large"))?;
        dst.reserve(2 + payload.len());
        dst.put_u16_le(length);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::frame::TAG_ANNOUNCE;

    #[test]
    fn decode_returns_none_on_incomplete_header() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&[0x01][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_returns_none_on_incomplete_payload() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&[0x03, 0x00, TAG_ANNOUNCE][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn zero_length_header_is_a_protocol_error() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversize_frame_is_a_protocol_error() {
        let mut codec = ControlCodec;
        let len = (MAX_FRAME_LEN + 1) as u16;
        let mut buf = BytesMut::new();
        buf.put_u16_le(len);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn round_trips_announce_frame() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&[0x03, 0x00, TAG_ANNOUNCE, 0x2E, 0x1F][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, ControlFrame::Announce { game_port: 7982 });
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_graceful_shutdown_with_correct_length_header() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(OutboundFrame::GracefulShutdown, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x01, 0x00, 0x22]);
    }
}
