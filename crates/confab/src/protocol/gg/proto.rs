//! Gadu-Gadu wire codec: little-endian packets behind a fixed 8-byte
//! header, decoded into typed events.

use winnow::binary::{le_u16, le_u32};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::rest;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

type PResult<T> = Result<T, ErrMode<ContextError>>;

pub(super) const GG_WELCOME: u32 = 0x0001;
pub(super) const GG_STATUS: u32 = 0x0002;
pub(super) const GG_LOGIN_OK: u32 = 0x0003;
pub(super) const GG_SEND_MSG: u32 = 0x000b;
pub(super) const GG_PONG: u32 = 0x0007;
pub(super) const GG_PING: u32 = 0x0008;
pub(super) const GG_LOGIN_FAILED: u32 = 0x0009;
pub(super) const GG_RECV_MSG: u32 = 0x000a;
pub(super) const GG_NOTIFY_REPLY: u32 = 0x000c;
pub(super) const GG_DISCONNECTING: u32 = 0x000d;
pub(super) const GG_LOGIN: u32 = 0x0031;
pub(super) const GG_NOTIFY: u32 = 0x0010;
pub(super) const GG_TYPING_NOTIFY: u32 = 0x0059;
pub(super) const GG_NEW_STATUS: u32 = 0x0038;

pub(super) const GG_STATUS_NOT_AVAIL: u32 = 0x0001;
pub(super) const GG_STATUS_AVAIL: u32 = 0x0002;
pub(super) const GG_STATUS_BUSY: u32 = 0x0003;
pub(super) const GG_STATUS_INVISIBLE: u32 = 0x0014;

pub(super) const GG_HEADER_LEN: usize = 8;

/// Fixed packet header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
pub(super) struct GgHeader {
    pub kind: U32,
    pub length: U32,
}

/// One decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum GgEvent {
    /// Server hello carrying the login seed.
    Welcome { seed: u32 },
    LoginOk,
    LoginFailed,
    /// Bulk presence for the notify list.
    NotifyReply(Vec<(u32, u32)>),
    /// One peer changed status.
    Status { uin: u32, status: u32 },
    /// An instant message.
    RecvMsg { uin: u32, seq: u32, text: String },
    /// Peer typing indicator; `length` 0 means stopped.
    TypingNotify { uin: u32, length: u16 },
    Pong,
    /// The server is closing the session.
    Disconnecting,
}

fn uin_status_list(input: &mut &[u8]) -> PResult<Vec<(u32, u32)>> {
    let mut entries = Vec::new();
    while input.len() >= 8 {
        let uin = le_u32.parse_next(input)?;
        let status = le_u32.parse_next(input)?;
        entries.push((uin, status));
    }
    Ok(entries)
}

fn recv_msg(input: &mut &[u8]) -> PResult<(u32, u32, String)> {
    let uin = le_u32.parse_next(input)?;
    let seq = le_u32.parse_next(input)?;
    let text: &[u8] = rest.parse_next(input)?;
    let text = crate::util::text::salvage_utf8(text.strip_suffix(&[0]).unwrap_or(text));
    Ok((uin, seq, text))
}

fn typing_notify(input: &mut &[u8]) -> PResult<(u16, u32)> {
    let length = le_u16.parse_next(input)?;
    let uin = le_u32.parse_next(input)?;
    Ok((length, uin))
}

/// Decode one packet body. Unknown packet kinds yield `None`; a truncated
/// body of a known kind is an error.
pub(super) fn parse_event(kind: u32, payload: &[u8]) -> Result<Option<GgEvent>, String> {
    let mut input = payload;
    let event = match kind {
        GG_WELCOME => {
            let seed = le_u32
                .parse_next(&mut input)
                .map_err(|e: ErrMode<ContextError>| format!("welcome: {e}"))?;
            GgEvent::Welcome { seed }
        }
        GG_LOGIN_OK => GgEvent::LoginOk,
        GG_LOGIN_FAILED => GgEvent::LoginFailed,
        GG_NOTIFY_REPLY => {
            let entries = uin_status_list(&mut input).map_err(|e| format!("notify: {e}"))?;
            GgEvent::NotifyReply(entries)
        }
        GG_STATUS => {
            let uin = le_u32
                .parse_next(&mut input)
                .map_err(|e: ErrMode<ContextError>| format!("status: {e}"))?;
            let status = le_u32
                .parse_next(&mut input)
                .map_err(|e: ErrMode<ContextError>| format!("status: {e}"))?;
            GgEvent::Status { uin, status }
        }
        GG_RECV_MSG => {
            let (uin, seq, text) = recv_msg(&mut input).map_err(|e| format!("msg: {e}"))?;
            GgEvent::RecvMsg { uin, seq, text }
        }
        GG_TYPING_NOTIFY => {
            let (length, uin) =
                typing_notify(&mut input).map_err(|e| format!("typing: {e}"))?;
            GgEvent::TypingNotify { uin, length }
        }
        GG_PONG => GgEvent::Pong,
        GG_DISCONNECTING => GgEvent::Disconnecting,
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Frame a packet: header plus body.
pub(super) fn build_packet(kind: u32, body: &[u8]) -> Vec<u8> {
    let header = GgHeader {
        kind: U32::new(kind),
        length: U32::new(body.len() as u32),
    };
    let mut packet = Vec::with_capacity(GG_HEADER_LEN + body.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(body);
    packet
}

pub(super) fn build_login(uin: u32, password: &str, status: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&uin.to_le_bytes());
    body.extend_from_slice(&status.to_le_bytes());
    body.extend_from_slice(password.as_bytes());
    body.push(0);
    build_packet(GG_LOGIN, &body)
}

pub(super) fn build_notify(uins: &[u32]) -> Vec<u8> {
    let mut body = Vec::with_capacity(uins.len() * 4);
    for uin in uins {
        body.extend_from_slice(&uin.to_le_bytes());
    }
    build_packet(GG_NOTIFY, &body)
}

pub(super) fn build_send_msg(uin: u32, seq: u32, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&uin.to_le_bytes());
    body.extend_from_slice(&seq.to_le_bytes());
    body.extend_from_slice(text.as_bytes());
    body.push(0);
    build_packet(GG_SEND_MSG, &body)
}

pub(super) fn build_typing(uin: u32, length: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&length.to_le_bytes());
    body.extend_from_slice(&uin.to_le_bytes());
    build_packet(GG_TYPING_NOTIFY, &body)
}

pub(super) fn build_new_status(status: u32, description: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&status.to_le_bytes());
    if let Some(description) = description {
        body.extend_from_slice(description.as_bytes());
        body.push(0);
    }
    build_packet(GG_NEW_STATUS, &body)
}

pub(super) fn build_ping() -> Vec<u8> {
    build_packet(GG_PING, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let packet = build_packet(GG_PING, &[1, 2, 3]);
        let header = GgHeader::read_from_bytes(&packet[..GG_HEADER_LEN]).unwrap();
        assert_eq!(header.kind.get(), GG_PING);
        assert_eq!(header.length.get(), 3);
        assert_eq!(&packet[GG_HEADER_LEN..], &[1, 2, 3]);
    }

    #[test]
    fn test_parse_welcome() {
        let event = parse_event(GG_WELCOME, &0x12345678u32.to_le_bytes()).unwrap();
        assert_eq!(event, Some(GgEvent::Welcome { seed: 0x12345678 }));
    }

    #[test]
    fn test_parse_recv_msg() {
        let packet = build_send_msg(1234, 7, "cześć");
        let body = &packet[GG_HEADER_LEN..];
        let event = parse_event(GG_RECV_MSG, body).unwrap();
        assert_eq!(
            event,
            Some(GgEvent::RecvMsg { uin: 1234, seq: 7, text: "cześć".into() })
        );
    }

    #[test]
    fn test_parse_notify_reply() {
        let mut body = Vec::new();
        body.extend_from_slice(&111u32.to_le_bytes());
        body.extend_from_slice(&GG_STATUS_AVAIL.to_le_bytes());
        body.extend_from_slice(&222u32.to_le_bytes());
        body.extend_from_slice(&GG_STATUS_NOT_AVAIL.to_le_bytes());
        let event = parse_event(GG_NOTIFY_REPLY, &body).unwrap();
        assert_eq!(
            event,
            Some(GgEvent::NotifyReply(vec![
                (111, GG_STATUS_AVAIL),
                (222, GG_STATUS_NOT_AVAIL)
            ]))
        );
    }

    #[test]
    fn test_parse_typing() {
        let packet = build_typing(555, 12);
        let event = parse_event(GG_TYPING_NOTIFY, &packet[GG_HEADER_LEN..]).unwrap();
        assert_eq!(event, Some(GgEvent::TypingNotify { uin: 555, length: 12 }));
    }

    #[test]
    fn test_unknown_kind_skipped() {
        assert_eq!(parse_event(0xdead, &[]).unwrap(), None);
    }

    #[test]
    fn test_truncated_known_kind_errors() {
        assert!(parse_event(GG_STATUS, &[1, 2]).is_err());
    }
}
