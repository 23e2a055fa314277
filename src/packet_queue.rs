use crate::packet::{MessageNumber, Packet, MESSAGE_NUMBER_MODULUS};
use crate::packet_list::PacketList;
use std::collections::VecDeque;

/// Only the first channels are eligible for dequeue; later channels wait until
///  earlier ones drain. Round-robin over the eligible channels keeps one large
///  message from starving standalone reliable traffic.
const MAX_ACTIVE_CHANNELS: usize = 16;

/// A multi-channel FIFO of packets pending transmission.
///
/// Channel 0 is the main channel for standalone packets and is never removed; every
///  queued packet list opens a new channel at the end. Dequeue visits the first
///  [MAX_ACTIVE_CHANNELS] channels round-robin, removing drained message channels.
#[derive(Debug)]
pub struct PacketQueue {
    channels: VecDeque<VecDeque<Packet>>,
    cursor: usize,
    current_message_number: MessageNumber,
}

impl PacketQueue {
    pub fn new(initial_message_number: MessageNumber) -> PacketQueue {
        let mut channels = VecDeque::new();
        channels.push_back(VecDeque::new());
        PacketQueue {
            channels,
            cursor: 0,
            current_message_number: initial_message_number % MESSAGE_NUMBER_MODULUS,
        }
    }

    /// The message number last assigned to an ordered packet list.
    pub fn current_message_number(&self) -> MessageNumber {
        self.current_message_number
    }

    fn next_message_number(&mut self) -> MessageNumber {
        self.current_message_number = (self.current_message_number + 1) % MESSAGE_NUMBER_MODULUS;
        self.current_message_number
    }

    /// Append a standalone packet to the main channel.
    pub fn queue_packet(&mut self, packet: Packet) {
        self.channels[0].push_back(packet);
    }

    /// Open a new channel holding the list's packets. An ordered list is stamped with
    ///  the next message number and FIRST/MIDDLE/LAST/ONLY positions at this point.
    pub fn queue_packet_list(&mut self, mut packet_list: PacketList) {
        if packet_list.is_ordered() {
            let message_number = self.next_message_number();
            packet_list.prepare_message(message_number);
        }
        self.channels
            .push_back(packet_list.into_packets().into());
    }

    /// True iff only the (empty) main channel remains.
    pub fn is_empty(&self) -> bool {
        self.channels.len() == 1 && self.channels[0].is_empty()
    }

    /// Dequeue one packet, visiting the first [MAX_ACTIVE_CHANNELS] channels in a
    ///  strict round-robin. Empty message channels encountered on the way are removed.
    pub fn take_packet(&mut self) -> Option<Packet> {
        let mut attempts = self.channels.len().min(MAX_ACTIVE_CHANNELS);

        while attempts > 0 {
            let active = self.channels.len().min(MAX_ACTIVE_CHANNELS);
            if self.cursor >= active {
                self.cursor = 0;
            }

            match self.channels[self.cursor].pop_front() {
                Some(packet) => {
                    self.cursor += 1;
                    return Some(packet);
                }
                None => {
                    if self.cursor == 0 {
                        self.cursor += 1;
                    } else {
                        self.channels.remove(self.cursor);
                    }
                    attempts -= 1;
                }
            }
        }
        None
    }
}
