use crate::sequence_number::SequenceNumber;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::{Debug, Formatter};

// first header word: C | 15-bit type | 16 bits unused
const CONTROL_BIT: u32 = 0x8000_0000;
const TYPE_SHIFT: u32 = 16;
const TYPE_MASK: u32 = 0x7fff;

const TYPE_ACK: u32 = 0;
const TYPE_HANDSHAKE: u32 = 1;
const TYPE_HANDSHAKE_ACK: u32 = 2;
const TYPE_HANDSHAKE_REQUEST: u32 = 3;

/// A control packet: the control bit, a 15-bit type, and a type-specific body.
///
/// ```ascii
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |C|           Type              |           (unused)            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     Control Data (per type)                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// An ACK acknowledges every sequence number strictly below the carried value.
/// Handshake and HandshakeACK carry the handshaking side's initial sequence number;
/// HandshakeRequest has no body.
#[derive(Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Ack { next_sequence_number: SequenceNumber },
    Handshake { initial_sequence_number: SequenceNumber },
    HandshakeAck { initial_sequence_number: SequenceNumber },
    HandshakeRequest,
}

impl ControlPacket {
    fn packet_type(&self) -> u32 {
        match self {
            ControlPacket::Ack { .. } => TYPE_ACK,
            ControlPacket::Handshake { .. } => TYPE_HANDSHAKE,
            ControlPacket::HandshakeAck { .. } => TYPE_HANDSHAKE_ACK,
            ControlPacket::HandshakeRequest => TYPE_HANDSHAKE_REQUEST,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(CONTROL_BIT | (self.packet_type() << TYPE_SHIFT));

        match self {
            ControlPacket::Ack {
                next_sequence_number,
            } => buf.put_u32(next_sequence_number.to_raw()),
            ControlPacket::Handshake {
                initial_sequence_number,
            }
            | ControlPacket::HandshakeAck {
                initial_sequence_number,
            } => buf.put_u32(initial_sequence_number.to_raw()),
            ControlPacket::HandshakeRequest => {}
        }
    }

    pub fn from_bytes(mut buf: &[u8]) -> anyhow::Result<ControlPacket> {
        let first_word = buf.try_get_u32()?;
        if first_word & CONTROL_BIT == 0 {
            bail!("control bit not set on a control packet");
        }

        match (first_word >> TYPE_SHIFT) & TYPE_MASK {
            TYPE_ACK => Ok(ControlPacket::Ack {
                next_sequence_number: SequenceNumber::from_raw(buf.try_get_u32()?),
            }),
            TYPE_HANDSHAKE => Ok(ControlPacket::Handshake {
                initial_sequence_number: SequenceNumber::from_raw(buf.try_get_u32()?),
            }),
            TYPE_HANDSHAKE_ACK => Ok(ControlPacket::HandshakeAck {
                initial_sequence_number: SequenceNumber::from_raw(buf.try_get_u32()?),
            }),
            TYPE_HANDSHAKE_REQUEST => Ok(ControlPacket::HandshakeRequest),
            unknown => bail!("unknown control packet type {}", unknown),
        }
    }

    /// Size on the wire, excluding UDP/IP overhead.
    pub fn data_size(&self) -> usize {
        match self {
            ControlPacket::HandshakeRequest => size_of::<u32>(),
            _ => 2 * size_of::<u32>(),
        }
    }
}

impl Debug for ControlPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPacket::Ack {
                next_sequence_number,
            } => write!(f, "ACK({})", next_sequence_number),
            ControlPacket::Handshake {
                initial_sequence_number,
            } => write!(f, "HANDSHAKE({})", initial_sequence_number),
            ControlPacket::HandshakeAck {
                initial_sequence_number,
            } => write!(f, "HANDSHAKE_ACK({})", initial_sequence_number),
            ControlPacket::HandshakeRequest => write!(f, "HANDSHAKE_REQUEST"),
        }
    }
}
