// src/core/master/chat.rs

//! The chat keep-alive sub-channel: a long-lived, length-framed TCP
//! connection to the chat server. Its opcode set is opaque to this system
//! except for three observable events (`connected`, `disconnected`,
//! `handshake_accepted`) and the outbound "server info" record sent once the
//! handshake is accepted (§4.7).
//!
//! Framing mirrors the manager control channel (§4.5): a 2-byte
//! little-endian length prefix followed by that many payload bytes, with the
//! first payload byte a tag. The concrete tag values and server-info
//! encoding are this system's own choice (the spec treats the rest of the
//! chat protocol as opaque) and are not shared with the manager control
//! channel's tag space.

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::core::errors::{FleetError, FleetResult};

const MAX_CHAT_FRAME_LEN: usize = 4096;

/// Sent by the chat server once it accepts our connection and is ready for
/// the server-info handshake record.
const TAG_HANDSHAKE_ACCEPTED: u8 = 0x01;
/// Sent by us once `TAG_HANDSHAKE_ACCEPTED` is observed.
const TAG_SERVER_INFO: u8 = 0x10;

/// The "server info" record sent on handshake acceptance (§4.7 field list).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerInfo {
    pub server_id: i64,
    pub login: String,
    pub region: String,
    pub display_name: String,
    pub version: String,
    pub external_ip: String,
    pub ping_port: u16,
}

/// An observable inbound frame. Every tag other than the handshake-accept
/// marker is opaque chat traffic this system does not need to interpret.
#[derive(Debug, Clone, PartialEq)]
enum ChatFrame {
    HandshakeAccepted,
    Opaque,
}

#[derive(Debug, Default)]
struct ChatCodec;

impl Decoder for ChatCodec {
    type Item = ChatFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let length = u16::from_le_bytes([src[0], src[1]]) as usize;
        if length == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "zero-length chat frame header",
            ));
        }
        if length > MAX_CHAT_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("chat frame of {length} bytes exceeds the scratch buffer"),
            ));
        }
        if src.len() < 2 + length {
            src.reserve(2 + length - src.len());
            return Ok(None);
        }
        src.advance(2);
        let payload = src.split_to(length);
        let tag = payload.first().copied().unwrap_or(0);
        Ok(Some(if tag == TAG_HANDSHAKE_ACCEPTED {
            ChatFrame::HandshakeAccepted
        } else {
            ChatFrame::Opaque
        }))
    }
}

impl Encoder<Vec<u8>> for ChatCodec {
    type Error = std::io::Error;

    fn encode(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length: u16 = payload
            .len()
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "chat frame too large"))?;
        dst.reserve(2 + payload.len());
        dst.put_u16_le(length);
        dst.put_slice(&payload);
        Ok(())
    }
}

fn encode_server_info(info: &ServerInfo) -> FleetResult<Vec<u8>> {
    let body = serde_json::to_vec(info)
        .map_err(|e| FleetError::ChatTransport(format!("failed to encode server info: {e}")))?;
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(TAG_SERVER_INFO);
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// The outcome of one chat session, reported back to the supervisor loop so
/// it can emit `connected`/`disconnected`/`handshake_accepted` and then
/// re-evaluate on its own schedule rather than reconnecting inline.
pub enum ChatOutcome {
    Disconnected,
    ProtocolError(String),
}

/// Dials the chat server once, sends the handshake record as soon as the
/// server accepts, and then drains frames until the connection drops.
/// Returns once the session ends; does not retry internally — the caller
/// owns the reconnect cadence (§4.7 "driven by the same loop").
pub async fn run_session(
    host: &str,
    port: u16,
    server_info: &ServerInfo,
    on_handshake_accepted: impl Fn(),
) -> FleetResult<ChatOutcome> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| FleetError::ChatTransport(format!("failed to connect to chat server: {e}")))?;
    let mut framed = Framed::new(stream, ChatCodec);

    loop {
        match framed.next().await {
            Some(Ok(ChatFrame::HandshakeAccepted)) => {
                on_handshake_accepted();
                let payload = encode_server_info(server_info)?;
                framed
                    .send(payload)
                    .await
                    .map_err(|e| FleetError::ChatTransport(format!("failed to send server info: {e}")))?;
            }
            Some(Ok(ChatFrame::Opaque)) => continue,
            Some(Err(e)) => return Ok(ChatOutcome::ProtocolError(e.to_string())),
            None => return Ok(ChatOutcome::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_encodes_with_leading_tag_byte() {
        let info = ServerInfo {
            server_id: 1,
            login: "host".into(),
            region: "us-east".into(),
            display_name: "Fleet Host".into(),
            version: "1.0.0".into(),
            external_ip: "203.0.113.1".into(),
            ping_port: 27960,
        };
        let payload = encode_server_info(&info).unwrap();
        assert_eq!(payload[0], TAG_SERVER_INFO);
    }

    #[test]
    fn codec_decodes_handshake_accept_tag() {
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        buf.put_u16_le(1);
        buf.put_u8(TAG_HANDSHAKE_ACCEPTED);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ChatFrame::HandshakeAccepted));
    }

    #[test]
    fn codec_treats_unknown_tags_as_opaque() {
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        buf.put_u16_le(1);
        buf.put_u8(0x7f);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ChatFrame::Opaque));
    }
}
