//! Control-plane message codec.
//!
//! Frames match the little-endian UDP control protocol spoken by physical
//! deployments, so simulated policy state can be reset and migrations
//! requested with the same bytes a switch controller would emit. Only the
//! codec lives here; there is no transport.
//!
//! Layout (all little-endian):
//!
//! ```text
//! header : u16 identifier = 0xDEAC | u8 type
//! Reset  : header | u16 num_nodes | u16 num_rkeys
//! Stats  : header
//! MigReq : header | u32 start | u32 end | u32 dst_node_id
//! MigRep : header | u8 ack (0 = OK, 1 = FAIL)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Protocol identifier carried by every frame.
pub const IDENTIFIER: u16 = 0xDEAC;

pub const TYPE_RESET: u8 = 0x0;
pub const TYPE_STATS: u8 = 0x1;
pub const TYPE_MIGRATION_REQUEST: u8 = 0x2;
pub const TYPE_MIGRATION_REPLY: u8 = 0x3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated: need {need} more bytes")]
    Truncated { need: usize },
    #[error("bad identifier {0:#06x}")]
    BadIdentifier(u16),
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("bad migration ack {0:#04x}")]
    BadAck(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAck {
    Ok,
    Fail,
}

impl MigrationAck {
    fn to_byte(self) -> u8 {
        match self {
            MigrationAck::Ok => 0,
            MigrationAck::Fail => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerMessage {
    /// Reinitialize the data plane for a node count and replicated-key
    /// count.
    Reset { num_nodes: u16, num_rkeys: u16 },
    /// Ask the data plane to report its statistics.
    Stats,
    /// Migrate the keys hashing into `[start, end]` to `dst_node_id`.
    MigrationRequest {
        start: u32,
        end: u32,
        dst_node_id: u32,
    },
    MigrationReply { ack: MigrationAck },
}

impl ControllerMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(IDENTIFIER);
        match self {
            ControllerMessage::Reset {
                num_nodes,
                num_rkeys,
            } => {
                buf.put_u8(TYPE_RESET);
                buf.put_u16_le(*num_nodes);
                buf.put_u16_le(*num_rkeys);
            }
            ControllerMessage::Stats => {
                buf.put_u8(TYPE_STATS);
            }
            ControllerMessage::MigrationRequest {
                start,
                end,
                dst_node_id,
            } => {
                buf.put_u8(TYPE_MIGRATION_REQUEST);
                buf.put_u32_le(*start);
                buf.put_u32_le(*end);
                buf.put_u32_le(*dst_node_id);
            }
            ControllerMessage::MigrationReply { ack } => {
                buf.put_u8(TYPE_MIGRATION_REPLY);
                buf.put_u8(ack.to_byte());
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 3 {
            return Err(CodecError::Truncated {
                need: 3 - buf.remaining(),
            });
        }
        let identifier = buf.get_u16_le();
        if identifier != IDENTIFIER {
            return Err(CodecError::BadIdentifier(identifier));
        }
        let msg_type = buf.get_u8();
        match msg_type {
            TYPE_RESET => {
                if buf.remaining() < 4 {
                    return Err(CodecError::Truncated {
                        need: 4 - buf.remaining(),
                    });
                }
                Ok(ControllerMessage::Reset {
                    num_nodes: buf.get_u16_le(),
                    num_rkeys: buf.get_u16_le(),
                })
            }
            TYPE_STATS => Ok(ControllerMessage::Stats),
            TYPE_MIGRATION_REQUEST => {
                if buf.remaining() < 12 {
                    return Err(CodecError::Truncated {
                        need: 12 - buf.remaining(),
                    });
                }
                Ok(ControllerMessage::MigrationRequest {
                    start: buf.get_u32_le(),
                    end: buf.get_u32_le(),
                    dst_node_id: buf.get_u32_le(),
                })
            }
            TYPE_MIGRATION_REPLY => {
                if buf.remaining() < 1 {
                    return Err(CodecError::Truncated { need: 1 });
                }
                match buf.get_u8() {
                    0 => Ok(ControllerMessage::MigrationReply {
                        ack: MigrationAck::Ok,
                    }),
                    1 => Ok(ControllerMessage::MigrationReply {
                        ack: MigrationAck::Fail,
                    }),
                    other => Err(CodecError::BadAck(other)),
                }
            }
            other => Err(CodecError::UnknownType(other)),
        }
    }
}
