use crate::packet::{MessageNumber, Packet, PacketPosition};

/// A group of packets queued together. An *ordered* list forms a single multi-packet
///  message: when it is enqueued, the packet queue stamps every packet with one message
///  number, FIRST/MIDDLE/LAST/ONLY positions and sequential part numbers.
#[derive(Debug)]
pub struct PacketList {
    packets: Vec<Packet>,
    reliable: bool,
    ordered: bool,
}

impl PacketList {
    pub fn new(reliable: bool, ordered: bool) -> PacketList {
        PacketList {
            packets: Vec::new(),
            reliable,
            ordered,
        }
    }

    /// Append a packet, forcing its reliable bit to the list's setting.
    pub fn push(&mut self, mut packet: Packet) {
        debug_assert!(
            !self.ordered || packet.is_part_of_message(),
            "packets of an ordered list must carry the message header words"
        );
        packet.set_reliable(self.reliable);
        self.packets.push(packet);
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Total payload bytes across all packets.
    pub fn message_size(&self) -> usize {
        self.packets.iter().map(|p| p.payload().len()).sum()
    }

    /// Stamp all packets as parts of one message. A single packet becomes ONLY;
    ///  otherwise the first is FIRST, the last is LAST, and everything in between
    ///  MIDDLE, with part numbers 0..n-1.
    pub fn prepare_message(&mut self, message_number: MessageNumber) {
        let count = self.packets.len();
        for (idx, packet) in self.packets.iter_mut().enumerate() {
            let position = if count == 1 {
                PacketPosition::Only
            } else if idx == 0 {
                PacketPosition::First
            } else if idx == count - 1 {
                PacketPosition::Last
            } else {
                PacketPosition::Middle
            };
            packet.write_message(message_number, position, idx as u32);
        }
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}
