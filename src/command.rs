//! Command and response packets.
//!
//! Both directions share the packet layout `tag, flags, reserved, count`
//! followed by `count` little-endian u32 parameters. Responses always carry
//! the status word as their first parameter.

use crate::frame::ProtocolError;
use crate::protocol::{CommandTag, PropertyTag, ResponseTag, Status, MAX_PARAMETERS};

/// Length of the packet header preceding the parameters
pub const PACKET_HEADER_LEN: usize = 4;

/// A command packet issued by the host
#[derive(Clone, PartialEq, Debug)]
pub struct Command {
    tag: CommandTag,
    flags: u8,
    params: Vec<u32>,
}

impl Command {
    /// Build a command, checking the parameter count against the protocol limit
    pub fn new(tag: CommandTag, params: &[u32]) -> Result<Self, ProtocolError> {
        if params.len() > MAX_PARAMETERS {
            return Err(ProtocolError::TooManyParameters {
                count: params.len(),
                max: MAX_PARAMETERS,
            });
        }

        Ok(Self {
            tag,
            flags: 0,
            params: params.to_vec(),
        })
    }

    fn with(tag: CommandTag, params: Vec<u32>) -> Self {
        Self {
            tag,
            flags: 0,
            params,
        }
    }

    pub fn flash_erase_all() -> Self {
        Self::with(CommandTag::FlashEraseAll, vec![0])
    }

    pub fn flash_erase_region(address: u32, count: u32) -> Self {
        Self::with(CommandTag::FlashEraseRegion, vec![address, count])
    }

    pub fn read_memory(address: u32, count: u32) -> Self {
        Self::with(CommandTag::ReadMemory, vec![address, count])
    }

    pub fn write_memory(address: u32, count: u32) -> Self {
        Self::with(CommandTag::WriteMemory, vec![address, count])
    }

    /// Query a property, memory id 0 is internal flash
    pub fn get_property(property: PropertyTag, memory_id: u32) -> Self {
        Self::with(CommandTag::GetProperty, vec![property as u32, memory_id])
    }

    pub fn reset() -> Self {
        Self::with(CommandTag::Reset, vec![])
    }

    pub fn tag(&self) -> CommandTag {
        self.tag
    }

    pub fn params(&self) -> &[u32] {
        &self.params
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_packet(self.tag as u8, self.flags, &self.params)
    }
}

/// Device response packets
#[derive(Clone, PartialEq, Debug)]
pub enum Response {
    Generic { status: Status, tag: u32 },
    ReadMemory { status: Status, data_byte_count: u32 },
    GetProperty { status: Status, values: Vec<u32> },
}

impl Response {
    pub fn status(&self) -> Status {
        match self {
            Response::Generic { status, .. } => *status,
            Response::ReadMemory { status, .. } => *status,
            Response::GetProperty { status, .. } => *status,
        }
    }

    pub fn response_tag(&self) -> ResponseTag {
        match self {
            Response::Generic { .. } => ResponseTag::GenericResponse,
            Response::ReadMemory { .. } => ResponseTag::ReadMemoryResponse,
            Response::GetProperty { .. } => ResponseTag::GetPropertyResponse,
        }
    }

    /// Encode a response packet, as a device would
    pub fn encode(&self) -> Vec<u8> {
        let mut params = vec![self.status().0];
        match self {
            Response::Generic { tag, .. } => params.push(*tag),
            Response::ReadMemory {
                data_byte_count, ..
            } => params.push(*data_byte_count),
            Response::GetProperty { values, .. } => params.extend_from_slice(values),
        }

        encode_packet(self.response_tag() as u8, 0, &params)
    }

    /// Decode the response to a command issued with tag `originating`
    pub fn decode(buff: &[u8], originating: CommandTag) -> Result<Self, ProtocolError> {
        if buff.len() < PACKET_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: PACKET_HEADER_LEN,
                actual: buff.len(),
            });
        }

        let count = buff[3] as usize;
        let expected = PACKET_HEADER_LEN + count * 4;
        if buff.len() < expected {
            return Err(ProtocolError::Truncated {
                expected,
                actual: buff.len(),
            });
        } else if buff.len() > expected {
            return Err(ProtocolError::TrailingBytes(buff.len() - expected));
        }

        let params: Vec<u32> = buff[PACKET_HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let status = match params.first() {
            Some(s) => Status(*s),
            None => return Err(ProtocolError::ParameterCount(0)),
        };

        let tag = ResponseTag::from_u8(buff[0]).ok_or(ProtocolError::UnknownResponseTag(buff[0]))?;
        let mismatch = ProtocolError::TagMismatch {
            expected: originating,
            actual: buff[0] as u32,
        };

        match (tag, originating) {
            (ResponseTag::GenericResponse, _) => {
                if params.len() != 2 {
                    return Err(ProtocolError::ParameterCount(params.len()));
                }
                if params[1] != originating as u32 {
                    return Err(ProtocolError::TagMismatch {
                        expected: originating,
                        actual: params[1],
                    });
                }
                Ok(Response::Generic {
                    status,
                    tag: params[1],
                })
            }
            (ResponseTag::ReadMemoryResponse, CommandTag::ReadMemory) => {
                if params.len() != 2 {
                    return Err(ProtocolError::ParameterCount(params.len()));
                }
                Ok(Response::ReadMemory {
                    status,
                    data_byte_count: params[1],
                })
            }
            (ResponseTag::GetPropertyResponse, CommandTag::GetProperty) => {
                Ok(Response::GetProperty {
                    status,
                    values: params[1..].to_vec(),
                })
            }
            _ => Err(mismatch),
        }
    }
}

fn encode_packet(tag: u8, flags: u8, params: &[u32]) -> Vec<u8> {
    let mut buff = Vec::with_capacity(PACKET_HEADER_LEN + params.len() * 4);
    buff.extend_from_slice(&[tag, flags, 0, params.len() as u8]);
    for p in params {
        buff.extend_from_slice(&p.to_le_bytes());
    }
    buff
}
