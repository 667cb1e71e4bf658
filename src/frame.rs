//! Framing packet codec.
//!
//! Control frames (ack, nak, ack-abort, ping) are the start byte followed by
//! the frame type. All other frames carry a header of
//! `start, type, length (u16 LE), crc16 (u16 LE)` followed by the payload.
//! The CRC covers the type, length and payload bytes.

use crate::protocol::{FrameType, Version, START_BYTE};

/// Length of the start byte + type pair
pub const CONTROL_FRAME_LEN: usize = 2;

/// Length of the variable frame header
pub const HEADER_LEN: usize = 6;

/// Payload length of a ping response
pub const PING_RESPONSE_LEN: usize = 6;

/// Errors in the structure of frames and responses
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid start byte 0x{0:02x}")]
    InvalidStart(u8),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("truncated input, expected {expected} bytes but got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLong(usize),
    #[error("ping response payload of {0} bytes, expected 6")]
    InvalidPingResponse(usize),
    #[error("{count} command parameters exceed the maximum of {max}")]
    TooManyParameters { count: usize, max: usize },
    #[error("unknown response tag 0x{0:02x}")]
    UnknownResponseTag(u8),
    #[error("response to {expected:?} carries tag 0x{actual:02x}")]
    TagMismatch {
        expected: crate::protocol::CommandTag,
        actual: u32,
    },
    #[error("response with {0} parameters is malformed")]
    ParameterCount(usize),
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
    #[error("requested {expected} bytes but the device will send {actual}")]
    ByteCountMismatch { expected: u32, actual: u32 },
    #[error("received {received} bytes, more than the {expected} requested")]
    Overrun { expected: usize, received: usize },
    #[error("session is {0:?}")]
    InvalidState(crate::session::State),
    #[error("retry failure: {0}")]
    Retry(String),
}

/// Frame decoding errors
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum CodecError {
    #[error("checksum mismatch, received 0x{received:04x} computed 0x{computed:04x}")]
    Checksum { received: u16, computed: u16 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Payload of a ping response frame
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PingResponse {
    pub version: Version,
    pub options: u16,
}

impl PingResponse {
    fn encode(&self) -> [u8; PING_RESPONSE_LEN] {
        let o = self.options.to_le_bytes();
        [
            self.version.bugfix,
            self.version.minor,
            self.version.major,
            self.version.name,
            o[0],
            o[1],
        ]
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != PING_RESPONSE_LEN {
            return Err(ProtocolError::InvalidPingResponse(payload.len()));
        }

        Ok(Self {
            version: Version {
                bugfix: payload[0],
                minor: payload[1],
                major: payload[2],
                name: payload[3],
            },
            options: u16::from_le_bytes([payload[4], payload[5]]),
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Frame {
    Ping,
    PingResponse(PingResponse),
    Ack,
    Nak,
    AckAbort,
    /// Command or response packet
    Command(Vec<u8>),
    Data(Vec<u8>),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Ping => FrameType::Ping,
            Frame::PingResponse(_) => FrameType::PingResponse,
            Frame::Ack => FrameType::Ack,
            Frame::Nak => FrameType::Nak,
            Frame::AckAbort => FrameType::AckAbort,
            Frame::Command(_) => FrameType::Command,
            Frame::Data(_) => FrameType::Data,
        }
    }

    /// Encode the frame for transmission
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let t = self.frame_type() as u8;

        let ping;
        let payload: &[u8] = match self {
            Frame::Ping | Frame::Ack | Frame::Nak | Frame::AckAbort => {
                return Ok(vec![START_BYTE, t]);
            }
            Frame::PingResponse(p) => {
                ping = p.encode();
                &ping[..]
            }
            Frame::Command(p) | Frame::Data(p) => p.as_slice(),
        };

        if payload.len() > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }
        let len = (payload.len() as u16).to_le_bytes();
        let crc = crc16_update(crc16(&[t, len[0], len[1]]), payload).to_le_bytes();

        let mut buff = Vec::with_capacity(HEADER_LEN + payload.len());
        buff.extend_from_slice(&[START_BYTE, t, len[0], len[1], crc[0], crc[1]]);
        buff.extend_from_slice(payload);

        Ok(buff)
    }

    /// Decode exactly one frame from `buff`
    pub fn decode(buff: &[u8]) -> Result<Self, CodecError> {
        if buff.len() < CONTROL_FRAME_LEN {
            return Err(ProtocolError::Truncated {
                expected: CONTROL_FRAME_LEN,
                actual: buff.len(),
            }
            .into());
        }
        if buff[0] != START_BYTE {
            return Err(ProtocolError::InvalidStart(buff[0]).into());
        }
        let t = FrameType::from_u8(buff[1]).ok_or(ProtocolError::UnknownFrameType(buff[1]))?;

        if t.is_control() {
            if buff.len() > CONTROL_FRAME_LEN {
                return Err(ProtocolError::TrailingBytes(buff.len() - CONTROL_FRAME_LEN).into());
            }
            let f = match t {
                FrameType::Ack => Frame::Ack,
                FrameType::Nak => Frame::Nak,
                FrameType::AckAbort => Frame::AckAbort,
                _ => Frame::Ping,
            };
            return Ok(f);
        }

        if buff.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                actual: buff.len(),
            }
            .into());
        }

        // Validate the checksum against the bytes actually present so that
        // corruption of the length field is reported as a checksum failure
        let payload = &buff[HEADER_LEN..];
        let received = u16::from_le_bytes([buff[4], buff[5]]);
        let computed = crc16_update(crc16(&buff[1..4]), payload);
        if received != computed {
            return Err(CodecError::Checksum { received, computed });
        }

        let len = u16::from_le_bytes([buff[2], buff[3]]) as usize;
        if len > payload.len() {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN + len,
                actual: buff.len(),
            }
            .into());
        } else if len < payload.len() {
            return Err(ProtocolError::TrailingBytes(payload.len() - len).into());
        }

        let f = match t {
            FrameType::PingResponse => Frame::PingResponse(PingResponse::decode(payload)?),
            FrameType::Command => Frame::Command(payload.to_vec()),
            _ => Frame::Data(payload.to_vec()),
        };

        Ok(f)
    }
}

/// Fetch the length of the complete frame at the head of `buff`, or `None`
/// if more data is required.
///
/// `buff` must begin with the start byte.
pub fn frame_length(buff: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buff.is_empty() {
        return Ok(None);
    }
    if buff[0] != START_BYTE {
        return Err(ProtocolError::InvalidStart(buff[0]));
    }
    if buff.len() < CONTROL_FRAME_LEN {
        return Ok(None);
    }

    let t = FrameType::from_u8(buff[1]).ok_or(ProtocolError::UnknownFrameType(buff[1]))?;
    if t.is_control() {
        return Ok(Some(CONTROL_FRAME_LEN));
    }
    if buff.len() < 4 {
        return Ok(None);
    }

    let len = HEADER_LEN + u16::from_le_bytes([buff[2], buff[3]]) as usize;
    if buff.len() < len {
        return Ok(None);
    }

    Ok(Some(len))
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0xFFFF, data)
}

/// Continue a CRC-16/CCITT-FALSE computation over more data
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
