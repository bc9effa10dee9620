//! Link wire format
//!
//! Every message on a link is a 6-byte header followed by `len` payload
//! bytes:
//!
//! ```text
//! +------+-----------+-----------+-------+
//! | type | len (BE)  | zone (BE) | crypt |
//! +------+-----------+-----------+-------+
//!   1B       2B          2B         1B
//! ```
//!
//! `crypt` names the cipher the payload was sealed with; 0 is plaintext.

use crate::protocol::ZoneId;
use crate::{Error, Result};

pub const HEADER_SIZE: usize = 6;

/// Heartbeat payload: 2-byte id and a 12-byte tag
pub const HEARTBEAT_LEN: usize = 14;
const HEARTBEAT_REQUEST_TAG: &[u8; 12] = b"HeartBeatReq";
const HEARTBEAT_REPLY_TAG: &[u8; 12] = b"HeartBeatRpl";

pub const MAX_ECHO_REQUEST: usize = 32;
pub const MAX_ECHO_REPLY: usize = 64;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    UserData = 0x01,
    HeartbeatRequest = 0x02,
    HeartbeatReply = 0x03,
    ZoneAnnouncement = 0x04,
    /// Reserved, payload skipped
    MultiLinkData = 0x05,
    /// Reserved, payload skipped
    CryptoData = 0x06,
    EchoRequest = 0x07,
    EchoReply = 0x08,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MsgType::UserData),
            0x02 => Some(MsgType::HeartbeatRequest),
            0x03 => Some(MsgType::HeartbeatReply),
            0x04 => Some(MsgType::ZoneAnnouncement),
            0x05 => Some(MsgType::MultiLinkData),
            0x06 => Some(MsgType::CryptoData),
            0x07 => Some(MsgType::EchoRequest),
            0x08 => Some(MsgType::EchoReply),
            _ => None,
        }
    }
}

/// Decoded frame header. The type stays raw so that unknown messages can
/// still be skipped by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub len: u16,
    pub zone: ZoneId,
    pub crypt: u8,
}

impl FrameHeader {
    pub fn new(kind: MsgType, len: u16, zone: ZoneId) -> Self {
        Self {
            kind: kind as u8,
            len,
            zone,
            crypt: 0,
        }
    }

    pub fn with_crypt(mut self, crypt: u8) -> Self {
        self.crypt = crypt;
        self
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Frame(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buffer.len()
            )));
        }
        Ok(Self {
            kind: buffer[0],
            len: u16::from_be_bytes([buffer[1], buffer[2]]),
            zone: u16::from_be_bytes([buffer[3], buffer[4]]),
            crypt: buffer[5],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let len = self.len.to_be_bytes();
        let zone = self.zone.to_be_bytes();
        [self.kind, len[0], len[1], zone[0], zone[1], self.crypt]
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u8(self.kind)
    }
}

/// Heartbeat message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Request(u16),
    Reply(u16),
}

impl Heartbeat {
    pub fn id(&self) -> u16 {
        match *self {
            Heartbeat::Request(id) | Heartbeat::Reply(id) => id,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            Heartbeat::Request(_) => MsgType::HeartbeatRequest,
            Heartbeat::Reply(_) => MsgType::HeartbeatReply,
        }
    }

    pub fn encode(&self) -> [u8; HEARTBEAT_LEN] {
        let tag = match self {
            Heartbeat::Request(_) => HEARTBEAT_REQUEST_TAG,
            Heartbeat::Reply(_) => HEARTBEAT_REPLY_TAG,
        };
        let mut out = [0u8; HEARTBEAT_LEN];
        out[..2].copy_from_slice(&self.id().to_be_bytes());
        out[2..].copy_from_slice(tag);
        out
    }

    /// Decode the payload of a heartbeat frame of type `kind`.
    pub fn parse(kind: MsgType, payload: &[u8]) -> Result<Self> {
        if payload.len() != HEARTBEAT_LEN {
            return Err(Error::Frame(format!(
                "heartbeat payload is {} bytes, expected {}",
                payload.len(),
                HEARTBEAT_LEN
            )));
        }
        let id = u16::from_be_bytes([payload[0], payload[1]]);
        let (heartbeat, tag) = match kind {
            MsgType::HeartbeatRequest => (Heartbeat::Request(id), HEARTBEAT_REQUEST_TAG),
            MsgType::HeartbeatReply => (Heartbeat::Reply(id), HEARTBEAT_REPLY_TAG),
            other => return Err(Error::Frame(format!("{other:?} is not a heartbeat"))),
        };
        if &payload[2..] != tag {
            return Err(Error::Frame("heartbeat tag mismatch".into()));
        }
        Ok(heartbeat)
    }
}

/// Zone announcement body: big-endian u16 ids
pub fn encode_zone_ids(ids: &[ZoneId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

pub fn parse_zone_ids(payload: &[u8]) -> Result<Vec<ZoneId>> {
    if payload.len() % 2 != 0 {
        return Err(Error::Frame(format!(
            "zone announcement has odd length {}",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
