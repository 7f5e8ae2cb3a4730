// src/core/control/frame.rs

//! Packet tags, the `0x42` status preamble, and the reverse-engineered roster
//! tail parser (§4.5, §9 "Binary parsing").

use crate::core::registry::{GamePhase, PlayerRosterEntry};

pub const TAG_ANNOUNCE: u8 = 0x40;
pub const TAG_CLOSED: u8 = 0x41;
pub const TAG_STATUS: u8 = 0x42;
pub const TAG_SHUTDOWN: u8 = 0x22;
pub const TAG_BROADCAST: u8 = 0x24;
pub const TAG_CONSOLE: u8 = 0x25;

/// The fixed-size preamble of a `0x42` status frame, decoded from byte
/// offsets relative to the tag.
const STATUS_PREAMBLE_LEN: usize = 54;

/// A frame received from a child (child → manager).
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// `0x40`: first frame on a session, carries the announced game port.
    Announce { game_port: u16 },
    /// `0x41`: the child closed cleanly.
    Closed,
    /// `0x42`: periodic status telemetry.
    Status(StatusFrame),
}

/// Decoded contents of a `0x42` status frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFrame {
    pub uptime_secs: u32,
    pub load_percent: f32,
    pub num_clients: u8,
    pub match_started: bool,
    pub game_phase: GamePhase,
    pub roster: Vec<PlayerRosterEntry>,
    /// Whether this frame carried roster-tail bytes at all (regardless of how
    /// many entries `parse_roster` could validate out of them). Distinguishes
    /// "no detail was sent" from "detail was sent but every anchor failed
    /// validation", which callers need to honour I4 correctly.
    pub has_roster_tail: bool,
}

/// A frame sent to a child (manager → child).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// `0x22`: request graceful shutdown.
    GracefulShutdown,
    /// `0x24`: broadcast a chat message to connected players.
    Broadcast(String),
    /// `0x25`: execute a console command.
    Console(String),
}

impl OutboundFrame {
    /// Serialises the payload (tag + body), not including the length header
    /// (the codec is responsible for that).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            OutboundFrame::GracefulShutdown => vec![TAG_SHUTDOWN],
            OutboundFrame::Broadcast(msg) => encode_tagged_ascii(TAG_BROADCAST, msg),
            OutboundFrame::Console(cmd) => encode_tagged_ascii(TAG_CONSOLE, cmd),
        }
    }
}

fn encode_tagged_ascii(tag: u8, text: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + text.len());
    payload.push(tag);
    payload.extend_from_slice(text.as_bytes());
    payload.push(0);
    payload
}

/// Decodes a single inbound payload (tag already consumed by caller is NOT
/// the convention here: `payload` includes the tag byte at index 0).
pub fn decode_payload(payload: &[u8]) -> Result<ControlFrame, String> {
    let tag = *payload
        .first()
        .ok_or_else(|| "empty payload".to_string())?;
    match tag {
        TAG_ANNOUNCE => {
            if payload.len() < 3 {
                return Err("0x40 announce frame too short".to_string());
            }
            let game_port = u16::from_le_bytes([payload[1], payload[2]]);
            Ok(ControlFrame::Announce { game_port })
        }
        TAG_CLOSED => Ok(ControlFrame::Closed),
        TAG_STATUS => decode_status(payload).map(ControlFrame::Status),
        other => Err(format!("unrecognised control-channel tag 0x{other:02x}")),
    }
}

fn decode_status(payload: &[u8]) -> Result<StatusFrame, String> {
    if payload.len() < STATUS_PREAMBLE_LEN {
        return Err(format!(
            "0x42 status frame too short: got {} bytes, need {}",
            payload.len(),
            STATUS_PREAMBLE_LEN
        ));
    }
    let uptime_secs = u32::from_le_bytes(payload[2..6].try_into().unwrap());
    let load_raw = u32::from_le_bytes(payload[6..10].try_into().unwrap());
    let load_percent = load_raw as f32 / 100.0;
    let num_clients = payload[10];
    let match_started = payload[11] != 0;
    let game_phase = GamePhase::from_byte(payload[40]);

    let has_roster_tail = payload.len() > STATUS_PREAMBLE_LEN && num_clients > 0;
    let roster = if has_roster_tail {
        let tail = &payload[STATUS_PREAMBLE_LEN..];
        let count = tail[0];
        parse_roster(&tail[1..], count)
    } else {
        Vec::new()
    };

    Ok(StatusFrame {
        uptime_secs,
        load_percent,
        num_clients,
        match_started,
        game_phase,
        roster,
        has_roster_tail,
    })
}

/// Scans `tail` for IPv4-dotted-quad anchors and reconstructs roster entries
/// around them. This heuristic is a reverse-engineered shape (§9): anchors
/// that fail to validate the subsequent name/location/ping-triple structure
/// are skipped rather than guessed at.
fn parse_roster(tail: &[u8], count: u8) -> Vec<PlayerRosterEntry> {
    let mut players = Vec::new();
    let mut i = 0usize;
    while i < tail.len() && players.len() < count as usize {
        match try_parse_ipv4(tail, i) {
            Some(ip_end) if ip_end < tail.len() && tail[ip_end] == 0 => {
                if i < 4 {
                    i += 1;
                    continue;
                }
                let account_id = i32::from_le_bytes(tail[i - 4..i].try_into().unwrap());
                let ip_str = String::from_utf8_lossy(&tail[i..ip_end]).into_owned();
                let mut cursor = ip_end + 1;

                // The NUL-terminated ip string that follows the anchor is
                // redundant with the anchor itself; it exists to validate
                // the shape. A mismatch means this anchor was a false
                // positive (e.g. an IPv4-looking substring inside a name or
                // location), so the entry is skipped, not guessed (§9).
                let Some(redundant_ip) = read_cstring(tail, &mut cursor) else {
                    i += 1;
                    continue;
                };
                if redundant_ip != ip_str {
                    i += 1;
                    continue;
                }
                let Some(name) = read_cstring(tail, &mut cursor) else {
                    i += 1;
                    continue;
                };
                let Some(location) = read_cstring(tail, &mut cursor) else {
                    i += 1;
                    continue;
                };
                if cursor + 6 > tail.len() {
                    i += 1;
                    continue;
                }
                let ping_min = u16::from_le_bytes([tail[cursor], tail[cursor + 1]]);
                let ping_avg = u16::from_le_bytes([tail[cursor + 2], tail[cursor + 3]]);
                let ping_max = u16::from_le_bytes([tail[cursor + 4], tail[cursor + 5]]);
                cursor += 6;

                players.push(PlayerRosterEntry {
                    account_id,
                    external_ip: ip_str,
                    display_name: name,
                    location_code: location,
                    ping_min,
                    ping_avg,
                    ping_max,
                    slot: None,
                });
                i = cursor;
            }
            _ => i += 1,
        }
    }
    players
}

fn try_parse_ipv4(buf: &[u8], start: usize) -> Option<usize> {
    let mut idx = start;
    for octet in 0..4 {
        let oct_start = idx;
        let mut digits = 0;
        while idx < buf.len() && buf[idx].is_ascii_digit() && digits < 3 {
            idx += 1;
            digits += 1;
        }
        if digits == 0 {
            return None;
        }
        let value: u32 = std::str::from_utf8(&buf[oct_start..idx]).ok()?.parse().ok()?;
        if value > 255 {
            return None;
        }
        if octet < 3 {
            if idx >= buf.len() || buf[idx] != b'.' {
                return None;
            }
            idx += 1;
        }
    }
    Some(idx)
}

fn read_cstring(buf: &[u8], cursor: &mut usize) -> Option<String> {
    let start = *cursor;
    let mut idx = start;
    while idx < buf.len() && buf[idx] != 0 {
        idx += 1;
    }
    if idx >= buf.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&buf[start..idx]).into_owned();
    *cursor = idx + 1;
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_preamble(uptime: u32, load_x100: u32, clients: u8, match_started: u8, phase: u8) -> Vec<u8> {
        let mut buf = vec![0u8; STATUS_PREAMBLE_LEN];
        buf[0] = TAG_STATUS;
        buf[2..6].copy_from_slice(&uptime.to_le_bytes());
        buf[6..10].copy_from_slice(&load_x100.to_le_bytes());
        buf[10] = clients;
        buf[11] = match_started;
        buf[40] = phase;
        buf
    }

    #[test]
    fn decodes_announce_frame() {
        let payload = [TAG_ANNOUNCE, 0x2E, 0x1F]; // 7982 LE
        match decode_payload(&payload).unwrap() {
            ControlFrame::Announce { game_port } => assert_eq!(game_port, 7982),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_closed_frame() {
        assert_eq!(decode_payload(&[TAG_CLOSED]).unwrap(), ControlFrame::Closed);
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(decode_payload(&[0x99]).is_err());
    }

    #[test]
    fn decodes_status_without_roster() {
        let buf = status_preamble(120, 4550, 0, 0, 5);
        match decode_payload(&buf).unwrap() {
            ControlFrame::Status(status) => {
                assert_eq!(status.uptime_secs, 120);
                assert!((status.load_percent - 45.5).abs() < f32::EPSILON);
                assert_eq!(status.num_clients, 0);
                assert!(!status.match_started);
                assert_eq!(status.game_phase, GamePhase::Playing);
                assert!(status.roster.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_status_with_one_player_roster() {
        let mut buf = status_preamble(10, 100, 1, 1, 0);
        let mut tail = vec![1u8]; // count = 1
        tail.extend_from_slice(&42i32.to_le_bytes()); // account id
        tail.extend_from_slice(b"1.2.3.4\0"); // anchor ip
        tail.extend_from_slice(b"1.2.3.4\0"); // redundant ip, used to validate
        tail.extend_from_slice(b"Player One\0");
        tail.extend_from_slice(b"US\0");
        tail.extend_from_slice(&10u16.to_le_bytes());
        tail.extend_from_slice(&20u16.to_le_bytes());
        tail.extend_from_slice(&30u16.to_le_bytes());
        buf.extend_from_slice(&tail);

        match decode_payload(&buf).unwrap() {
            ControlFrame::Status(status) => {
                assert_eq!(status.roster.len(), 1);
                let player = &status.roster[0];
                assert_eq!(player.account_id, 42);
                assert_eq!(player.external_ip, "1.2.3.4");
                assert_eq!(player.display_name, "Player One");
                assert_eq!(player.location_code, "US");
                assert_eq!((player.ping_min, player.ping_avg, player.ping_max), (10, 20, 30));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn zero_count_roster_tail_is_tolerated_and_ignored() {
        let mut buf = status_preamble(10, 100, 1, 0, 0);
        // count = 0 but there is trailing garbage; it must be ignored, not parsed.
        buf.extend_from_slice(&[0u8, 1, 2, 3, 4, 5, 6, 7]);
        match decode_payload(&buf).unwrap() {
            ControlFrame::Status(status) => assert!(status.roster.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_anchor_is_skipped_not_guessed() {
        let mut buf = status_preamble(10, 100, 1, 0, 0);
        let mut tail = vec![1u8];
        // An IPv4-looking substring with fewer than 4 bytes preceding it, so
        // there's no room for a valid account id; this anchor must be skipped
        // and no player produced.
        tail.extend_from_slice(b"1.2.3.4\0");
        buf.extend_from_slice(&tail);
        match decode_payload(&buf).unwrap() {
            ControlFrame::Status(status) => assert!(status.roster.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn encodes_outbound_frames() {
        assert_eq!(
            OutboundFrame::GracefulShutdown.encode_payload(),
            vec![TAG_SHUTDOWN]
        );
        assert_eq!(
            OutboundFrame::Broadcast("hi".into()).encode_payload(),
            vec![TAG_BROADCAST, b'h', b'i', 0]
        );
    }
}
