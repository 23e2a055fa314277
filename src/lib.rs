//! A reliable datagram transport over UDP for real-time interactive traffic.
//!
//! The transport is one-to-many and connection-oriented: a single UDP endpoint (the
//!  [socket::Socket]) talks to any number of peers, with per-peer state in a
//!  [connection::Connection] created on demand. It provides in-order reliable
//!  delivery of standalone packets and multi-packet messages, alongside an
//!  unreliable fast path that bypasses connection state entirely.
//!
//! ## Design goals
//!
//! * Message/packet oriented, not a byte stream: applications hand over packets and
//!   packet lists, and receive packets back through callbacks
//! * Low latency over maximum reliability: pacing and the flow window are driven by
//!   a pluggable congestion controller tuned for interactive traffic
//! * No delivery across resets: a connection reset (triggered by a handshake
//!   request on an established connection) discards in-flight state on both sides
//! * No fragmentation: every packet fits a standard Ethernet frame (1500 bytes
//!   including IP and UDP headers)
//!
//! ## Wire format
//!
//! Every packet starts with a 4-byte word in network byte order whose most
//!  significant bit discriminates data from control packets.
//!
//! Data packet:
//! ```ascii
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|R|M| O |                  Sequence Number (27)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | P |                  Message Number (30)                      |  only if M=1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Message Part Number                      |  only if M=1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Payload (variable)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! * `C` - control bit, 0 for data packets
//! * `R` - reliable bit: the packet is retained for retransmission until ACKed
//! * `M` - message bit: the two message words follow the first word
//! * `O` - 2-bit obfuscation level of the payload (level 0 is identity; not a
//!   security mechanism)
//! * `P` - 2-bit position of the packet within its message: ONLY=00, FIRST=10,
//!   MIDDLE=11, LAST=01
//!
//! Sequence numbers are 27-bit and wrap; ordering is wrap-aware "forward
//!  arithmetic" ([sequence_number::SequenceNumber]). Message numbers are 30-bit and
//!  assigned per ordered message.
//!
//! Control packet:
//! ```ascii
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|           Type              |           (unused)            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Control Data (per type)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Types: ACK (carries the next expected sequence number; cumulative), Handshake
//!  and HandshakeACK (carry the sender's initial sequence number), and
//!  HandshakeRequest (empty).
//!
//! ## Handshake
//!
//! Connections synchronize initial sequence numbers in three phases:
//!
//! ```ascii
//!   receiver                                 sender
//!      | --------- HandshakeRequest ---------> |   (on reliable data without
//!      | <------------ Handshake ------------- |    a known initial sequence
//!      | ------------ HandshakeACK ----------> |    number)
//! ```
//!
//! A data sender's pacing task re-sends its Handshake until the HandshakeACK
//!  arrives; reliable payload queued in the meantime is buffered, not transmitted.
//!  A HandshakeRequest on an *established* connection is the reset mechanism: both
//!  sides discard in-flight state and exchange fresh initial sequence numbers.
//!  There is no graceful close.
//!
//! ## Tasks
//!
//! One network task per socket owns all receive-side parsing and the ~10 ms sync
//!  tick (ACK emission, congestion recomputation, inactivity cleanup). Each
//!  connection's [send_queue::SendQueue] runs its own pacing task. Application
//!  tasks call the write operations; callbacks are dispatched from the network
//!  task.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod control_packet;
pub mod loss_list;
pub mod message_dispatcher;
pub mod packet;
pub mod packet_list;
pub mod packet_queue;
pub mod send_queue;
pub mod send_socket;
pub mod sequence_number;
pub mod socket;
pub mod stats;

pub use config::SocketConfig;
pub use congestion::{CongestionControl, VegasCongestionControl};
pub use control_packet::ControlPacket;
pub use message_dispatcher::{
    ConnectionCreationFilter, DatagramHandler, MessageHandler, PacketFilter, PacketHandler,
    SocketErrorHandler,
};
pub use packet::{
    MessageNumber, ObfuscationLevel, ObfuscationTable, Packet, PacketPosition, WirePacket,
};
pub use packet_list::PacketList;
pub use sequence_number::SequenceNumber;
pub use socket::Socket;
pub use stats::ConnectionStats;
