use crate::control_packet::ControlPacket;
use crate::sequence_number::SequenceNumber;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

/// IPv4 header (20 bytes) plus UDP header (8 bytes).
pub const UDP_IPV4_HEADER_SIZE: usize = 28;

/// The transport targets standard Ethernet frames: 1500 bytes including IP and UDP
///  headers, leaving 1472 bytes of datagram payload.
pub const MAX_DATAGRAM_SIZE: usize = 1500 - UDP_IPV4_HEADER_SIZE;

// first header word: C | R | M | OO | 27-bit sequence number
const CONTROL_BIT: u32 = 0x8000_0000;
const RELIABLE_BIT: u32 = 0x4000_0000;
const MESSAGE_BIT: u32 = 0x2000_0000;
const OBFUSCATION_SHIFT: u32 = 27;
const SEQUENCE_MASK: u32 = 0x07ff_ffff;

// second header word (only if M=1): PP | 30-bit message number
const POSITION_SHIFT: u32 = 30;
const MESSAGE_NUMBER_MASK: u32 = 0x3fff_ffff;

/// Message numbers identify one multi-packet (or standalone ordered) message and wrap
///  modulo 2^30.
pub type MessageNumber = u32;
pub const MESSAGE_NUMBER_MODULUS: MessageNumber = 1 << 30;

/// Zero-based index of a packet within its message.
pub type MessagePartNumber = u32;

/// Where a packet sits within its message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketPosition {
    Only,
    First,
    Middle,
    Last,
}

impl PacketPosition {
    fn bits(self) -> u32 {
        match self {
            PacketPosition::Only => 0b00,
            PacketPosition::First => 0b10,
            PacketPosition::Middle => 0b11,
            PacketPosition::Last => 0b01,
        }
    }

    fn from_bits(bits: u32) -> PacketPosition {
        match bits & 0b11 {
            0b00 => PacketPosition::Only,
            0b10 => PacketPosition::First,
            0b11 => PacketPosition::Middle,
            _ => PacketPosition::Last,
        }
    }

    /// Whether this packet completes its message.
    pub fn is_final(self) -> bool {
        matches!(self, PacketPosition::Only | PacketPosition::Last)
    }
}

/// The payload obfuscation level carried in the header's two O bits.
///
/// Obfuscation is not a security mechanism: it exists to keep well-meaning middleboxes
///  and naive packet inspection from acting on payload contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObfuscationLevel {
    None,
    Level1,
    Level2,
    Level3,
}

impl ObfuscationLevel {
    fn bits(self) -> u32 {
        match self {
            ObfuscationLevel::None => 0,
            ObfuscationLevel::Level1 => 1,
            ObfuscationLevel::Level2 => 2,
            ObfuscationLevel::Level3 => 3,
        }
    }

    fn from_bits(bits: u32) -> ObfuscationLevel {
        match bits & 0b11 {
            0 => ObfuscationLevel::None,
            1 => ObfuscationLevel::Level1,
            2 => ObfuscationLevel::Level2,
            _ => ObfuscationLevel::Level3,
        }
    }
}

/// The per-level payload transforms, injected per connection rather than kept as
///  process-wide state. Each level XORs the payload with a repeating 64-bit key, so
///  every transform is stateless and its own inverse. Level 0 is the identity.
#[derive(Clone, Debug)]
pub struct ObfuscationTable {
    keys: [u64; 3],
}

impl Default for ObfuscationTable {
    fn default() -> Self {
        ObfuscationTable {
            keys: [
                0x6c65_6e74_726f_7064,
                0x4e6f_7468_696e_6720,
                0x7365_6372_6574_2121,
            ],
        }
    }
}

impl ObfuscationTable {
    pub fn new(keys: [u64; 3]) -> ObfuscationTable {
        ObfuscationTable { keys }
    }

    pub fn apply(&self, level: ObfuscationLevel, payload: &mut [u8]) {
        let key = match level {
            ObfuscationLevel::None => return,
            ObfuscationLevel::Level1 => self.keys[0],
            ObfuscationLevel::Level2 => self.keys[1],
            ObfuscationLevel::Level3 => self.keys[2],
        };
        let key_bytes = key.to_be_bytes();
        for (idx, byte) in payload.iter_mut().enumerate() {
            *byte ^= key_bytes[idx % key_bytes.len()];
        }
    }
}

/// A data packet: the first header word plus, for message parts, the message words,
///  followed by the payload.
///
/// ```ascii
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |C|R|M| O |                  Sequence Number                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | P |                     Message Number                        |  only if M=1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Message Part Number                      |  only if M=1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Payload (variable)                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The header fields are uncommitted until the packet goes on the wire: the sequence
///  number in particular is stamped at transmit time, not at enqueue time.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    reliable: bool,
    part_of_message: bool,
    obfuscation_level: ObfuscationLevel,
    sequence_number: SequenceNumber,
    message_number: MessageNumber,
    position: PacketPosition,
    message_part_number: MessagePartNumber,
    payload: BytesMut,
    sender_addr: Option<SocketAddr>,
}

impl Packet {
    /// Header size in bytes for a packet with or without the message words.
    pub fn header_size(part_of_message: bool) -> usize {
        if part_of_message {
            3 * size_of::<u32>()
        } else {
            size_of::<u32>()
        }
    }

    /// The largest payload that still fits a standard Ethernet frame.
    pub fn max_payload_size(part_of_message: bool) -> usize {
        MAX_DATAGRAM_SIZE - Self::header_size(part_of_message)
    }

    /// Create an empty data packet with the given payload capacity (clamped to what
    ///  fits the MTU).
    pub fn new_data(size: usize, reliable: bool, part_of_message: bool) -> Packet {
        let capacity = size.min(Self::max_payload_size(part_of_message));
        Packet {
            reliable,
            part_of_message,
            obfuscation_level: ObfuscationLevel::None,
            sequence_number: SequenceNumber::ZERO,
            message_number: 0,
            position: PacketPosition::Only,
            message_part_number: 0,
            payload: BytesMut::with_capacity(capacity),
            sender_addr: None,
        }
    }

    /// Parse a received data packet. The buffer must start with the first header word;
    ///  a set control bit or a truncated header is a parse error, and the caller drops
    ///  the packet.
    pub fn from_bytes(mut buf: &[u8], sender_addr: SocketAddr) -> anyhow::Result<Packet> {
        let first_word = buf.try_get_u32()?;
        if first_word & CONTROL_BIT != 0 {
            bail!("control bit set on a data packet");
        }

        let part_of_message = first_word & MESSAGE_BIT != 0;
        let (message_number, position, message_part_number) = if part_of_message {
            let message_word = buf.try_get_u32()?;
            (
                message_word & MESSAGE_NUMBER_MASK,
                PacketPosition::from_bits(message_word >> POSITION_SHIFT),
                buf.try_get_u32()?,
            )
        } else {
            (0, PacketPosition::Only, 0)
        };

        Ok(Packet {
            reliable: first_word & RELIABLE_BIT != 0,
            part_of_message,
            obfuscation_level: ObfuscationLevel::from_bits(first_word >> OBFUSCATION_SHIFT),
            sequence_number: SequenceNumber::from_raw(first_word & SEQUENCE_MASK),
            message_number,
            position,
            message_part_number,
            payload: BytesMut::from(buf),
            sender_addr: Some(sender_addr),
        })
    }

    /// Serialize header and payload for the wire.
    pub fn ser(&self, buf: &mut BytesMut) {
        let mut first_word = self.sequence_number.to_raw() & SEQUENCE_MASK;
        if self.reliable {
            first_word |= RELIABLE_BIT;
        }
        if self.part_of_message {
            first_word |= MESSAGE_BIT;
        }
        first_word |= self.obfuscation_level.bits() << OBFUSCATION_SHIFT;
        buf.put_u32(first_word);

        if self.part_of_message {
            buf.put_u32(
                (self.position.bits() << POSITION_SHIFT)
                    | (self.message_number & MESSAGE_NUMBER_MASK),
            );
            buf.put_u32(self.message_part_number);
        }

        buf.put_slice(&self.payload);
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn set_reliable(&mut self, reliable: bool) {
        self.reliable = reliable;
    }

    pub fn is_part_of_message(&self) -> bool {
        self.part_of_message
    }

    pub fn obfuscation_level(&self) -> ObfuscationLevel {
        self.obfuscation_level
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn message_number(&self) -> MessageNumber {
        self.message_number
    }

    pub fn position(&self) -> PacketPosition {
        self.position
    }

    pub fn message_part_number(&self) -> MessagePartNumber {
        self.message_part_number
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    pub fn sender_addr(&self) -> Option<SocketAddr> {
        self.sender_addr
    }

    /// Header plus payload, excluding UDP/IP overhead.
    pub fn data_size(&self) -> usize {
        Self::header_size(self.part_of_message) + self.payload.len()
    }

    /// Size on the wire including UDP/IP headers.
    pub fn wire_size(&self) -> usize {
        self.data_size() + UDP_IPV4_HEADER_SIZE
    }

    /// Stamp the sequence number. Called by the sender immediately before the packet
    ///  is committed to the wire.
    pub fn write_sequence_number(&mut self, sequence_number: SequenceNumber) {
        self.sequence_number = sequence_number;
    }

    /// Stamp message number, position and part number. The packet must have been
    ///  created with the message bit set.
    pub fn write_message(
        &mut self,
        message_number: MessageNumber,
        position: PacketPosition,
        message_part_number: MessagePartNumber,
    ) {
        debug_assert!(self.part_of_message);
        self.message_number = message_number & MESSAGE_NUMBER_MASK;
        self.position = position;
        self.message_part_number = message_part_number;
    }

    /// Re-obfuscate the payload to `level`: the current transform is undone first, so
    ///  `obfuscate(ObfuscationLevel::None, ..)` restores the cleartext payload.
    pub fn obfuscate(&mut self, level: ObfuscationLevel, table: &ObfuscationTable) {
        table.apply(self.obfuscation_level, &mut self.payload);
        table.apply(level, &mut self.payload);
        self.obfuscation_level = level;
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.part_of_message {
            write!(
                f,
                "DATA{{{:?}{}{}:msg {}/{:?}/{} len {}}}",
                self.sequence_number,
                if self.reliable { " R" } else { "" },
                match self.obfuscation_level {
                    ObfuscationLevel::None => "".to_string(),
                    other => format!(" O{}", other.bits()),
                },
                self.message_number,
                self.position,
                self.message_part_number,
                self.payload.len(),
            )
        } else {
            write!(
                f,
                "DATA{{{:?}{} len {}}}",
                self.sequence_number,
                if self.reliable { " R" } else { "" },
                self.payload.len(),
            )
        }
    }
}

/// What a received datagram turned out to be, discriminated by the control bit.
#[derive(Debug)]
pub enum WirePacket {
    Data(Packet),
    Control(ControlPacket),
}

impl WirePacket {
    pub fn parse(buf: &[u8], sender_addr: SocketAddr) -> anyhow::Result<WirePacket> {
        let mut peek: &[u8] = buf;
        let first_word = peek.try_get_u32()?;
        if first_word & CONTROL_BIT != 0 {
            Ok(WirePacket::Control(ControlPacket::from_bytes(buf)?))
        } else {
            Ok(WirePacket::Data(Packet::from_bytes(buf, sender_addr)?))
        }
    }
}
