pub mod batch;
pub mod codec;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::attestation::types::Phase;
use crate::error::FrameError;

/// Magic bytes: 0xC7 0x54 ("Confidential Tx").
pub const MAGIC: u16 = 0xC754;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Hard cap on any payload: 16 MiB.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Default cap on a single attestation handshake frame: 64 KiB.
pub const MAX_HANDSHAKE_FRAME_SIZE: u32 = 64 * 1024;

/// Frame message types.
///
/// Handshake phases, post-handshake peer traffic and engine traffic use
/// disjoint codes so a frame can never be read as belonging to another stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Auth = 0x01,
    Verify = 0x02,
    RequestKey = 0x03,
    ResponseKey = 0x04,
    Confirm = 0x05,
    Transactions = 0x10,
    Disconnect = 0x11,
    Request = 0x20,
    Response = 0x21,
    StreamBatch = 0x22,
    EngineFailure = 0x23,
}

impl FrameType {
    pub fn from_u8(v: u8) -> std::result::Result<Self, FrameError> {
        match v {
            0x01 => Ok(Self::Auth),
            0x02 => Ok(Self::Verify),
            0x03 => Ok(Self::RequestKey),
            0x04 => Ok(Self::ResponseKey),
            0x05 => Ok(Self::Confirm),
            0x10 => Ok(Self::Transactions),
            0x11 => Ok(Self::Disconnect),
            0x20 => Ok(Self::Request),
            0x21 => Ok(Self::Response),
            0x22 => Ok(Self::StreamBatch),
            0x23 => Ok(Self::EngineFailure),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// The handshake phase this frame type belongs to, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::Auth => Some(Phase::Auth),
            Self::Verify => Some(Phase::Verify),
            Self::RequestKey => Some(Phase::RequestKey),
            Self::ResponseKey => Some(Phase::ResponseKey),
            _ => None,
        }
    }
}

impl From<Phase> for FrameType {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Auth => Self::Auth,
            Phase::Verify => Self::Verify,
            Phase::RequestKey => Self::RequestKey,
            Phase::ResponseKey => Self::ResponseKey,
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: FrameType,
    pub sequence: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Encode the header into bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
        buf.put_u32(self.sequence);
        buf.put_u32(self.payload_len);
    }

    /// Decode a header from a buffer. Returns `None` if not enough bytes.
    pub fn decode(buf: &mut BytesMut) -> std::result::Result<Option<Self>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }

        let version = buf[2];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let msg_type = FrameType::from_u8(buf[3])?;
        let sequence = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.advance(HEADER_SIZE);

        Ok(Some(Self {
            version,
            msg_type,
            sequence,
            payload_len,
        }))
    }
}

/// A complete frame: header + payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    fn new(msg_type: FrameType, sequence: u32, payload: Bytes) -> Self {
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                msg_type,
                sequence,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }

    /// Create a handshake frame for `phase`. The sequence is the phase index.
    pub fn handshake(phase: Phase, payload: Bytes) -> Self {
        Self::new(phase.into(), phase.index(), payload)
    }

    /// Create the closing handshake frame: every phase payload was accepted.
    pub fn confirm() -> Self {
        Self::new(FrameType::Confirm, Phase::ALL.len() as u32, Bytes::new())
    }

    /// Create a confidential transaction relay frame.
    pub fn transactions(sequence: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Transactions, sequence, payload)
    }

    /// Create a disconnect frame. `phase` is set when the disconnect ends a handshake.
    pub fn disconnect(sequence: u32, phase: Option<Phase>, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(1 + reason.len());
        buf.put_u8(phase.map_or(0, |p| p.index() as u8 + 1));
        buf.put_slice(reason.as_bytes());
        Self::new(FrameType::Disconnect, sequence, buf.freeze())
    }

    /// Create an engine request frame; the sequence is the call id.
    pub fn request(call_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Request, call_id, payload)
    }

    /// Create an engine response frame answering `call_id`.
    pub fn response(call_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Response, call_id, payload)
    }

    /// Create a streamed batch frame.
    pub fn stream_batch(sequence: u32, payload: Bytes) -> Self {
        Self::new(FrameType::StreamBatch, sequence, payload)
    }

    /// Create an engine failure frame answering `call_id`.
    pub fn engine_failure(call_id: u32, message: &str) -> Self {
        Self::new(
            FrameType::EngineFailure,
            call_id,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    /// Split a disconnect payload into the optional handshake phase and the reason.
    pub fn disconnect_reason(&self) -> (Option<Phase>, String) {
        let mut payload = &self.payload[..];
        if payload.is_empty() {
            return (None, String::new());
        }
        let tag = payload.get_u8();
        let phase = tag.checked_sub(1).and_then(|i| Phase::from_index(i as u32));
        (phase, String::from_utf8_lossy(payload).into_owned())
    }
}
