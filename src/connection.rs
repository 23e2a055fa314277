use crate::config::SocketConfig;
use crate::congestion::CongestionControl;
use crate::control_packet::ControlPacket;
use crate::loss_list::LossList;
use crate::message_dispatcher::HandlerRegistry;
use crate::packet::{MessageNumber, Packet};
use crate::packet_list::PacketList;
use crate::send_queue::{SendQueue, SendQueueEvent};
use crate::send_socket::SendSocket;
use crate::sequence_number::SequenceNumber;
use crate::stats::ConnectionStats;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// After this many ACKs repeating the same value, the sender assumes the packet they
///  point at was lost and retransmits it without waiting for a timeout.
const FAST_RETRANSMIT_ACK_COUNT: u32 = 3;

/// The packets of one partially received message, ordered by part number, plus the
///  next part the application is waiting for.
#[derive(Debug, Default)]
struct PendingReceivedMessage {
    packets: Vec<Packet>,
    next_part_number: u32,
    last_progress: Option<Instant>,
}

impl PendingReceivedMessage {
    fn enqueue(&mut self, packet: Packet) {
        let part = packet.message_part_number();
        if part < self.next_part_number {
            return;
        }

        // packets usually arrive in order, so scan for the slot from the back
        let mut idx = self.packets.len();
        while idx > 0 && part < self.packets[idx - 1].message_part_number() {
            idx -= 1;
        }
        if idx > 0 && self.packets[idx - 1].message_part_number() == part {
            return;
        }
        self.packets.insert(idx, packet);
        self.last_progress = Some(Instant::now());
    }

    fn has_available_packets(&self) -> bool {
        self.packets
            .first()
            .is_some_and(|p| p.message_part_number() == self.next_part_number)
    }

    fn remove_next_packet(&mut self) -> Option<Packet> {
        if !self.has_available_packets() {
            return None;
        }
        self.next_part_number += 1;
        self.last_progress = Some(Instant::now());
        Some(self.packets.remove(0))
    }

    fn is_stale(&self, timeout: std::time::Duration) -> bool {
        self.last_progress
            .is_some_and(|at| at.elapsed() > timeout)
    }
}

/// What the periodic sync found: an `Inactive` connection has no send queue, nothing
///  in flight and no partially received messages, so its owner may discard it.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Active,
    Inactive,
}

/// Per-peer connection state: the three-phase handshake, the lazily started send
///  queue, the receive-side sequence tracking with ACK emission, and reassembly of
///  multi-packet messages.
///
/// All methods run on the socket's network task; cross-task interaction goes through
///  the send queue's handles and the event channel drained in [Connection::sync].
pub struct Connection {
    config: Arc<SocketConfig>,
    socket: Arc<dyn SendSocket>,
    destination: SocketAddr,
    congestion: Box<dyn CongestionControl>,
    handlers: Arc<HandlerRegistry>,

    send_queue: Option<Arc<SendQueue>>,
    events_tx: mpsc::UnboundedSender<SendQueueEvent>,
    events_rx: mpsc::UnboundedReceiver<SendQueueEvent>,

    /// Our randomized initial sequence number; the peer echoes it in HandshakeACK and
    ///  it identifies this incarnation of the connection across resets.
    initial_sequence_number: SequenceNumber,
    /// The peer's initial sequence number, learned from its Handshake.
    initial_receive_sequence_number: Option<SequenceNumber>,
    last_received_sequence_number: SequenceNumber,
    /// Gaps in the received sequence, pending arrival.
    loss_list: LossList,
    last_ack_sent: Option<SequenceNumber>,
    last_received_ack: Option<SequenceNumber>,
    duplicate_ack_count: u32,
    last_message_number: MessageNumber,

    pending_received_messages: BTreeMap<MessageNumber, PendingReceivedMessage>,

    has_received_handshake: bool,
    has_received_handshake_ack: bool,
    did_request_handshake: bool,

    stats: ConnectionStats,
}

impl Connection {
    pub fn new(
        config: Arc<SocketConfig>,
        socket: Arc<dyn SendSocket>,
        destination: SocketAddr,
        congestion: Box<dyn CongestionControl>,
        handlers: Arc<HandlerRegistry>,
    ) -> Connection {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Connection {
            config,
            socket,
            destination,
            congestion,
            handlers,
            send_queue: None,
            events_tx,
            events_rx,
            initial_sequence_number: SequenceNumber::random(),
            initial_receive_sequence_number: None,
            last_received_sequence_number: SequenceNumber::ZERO,
            loss_list: LossList::new(),
            last_ack_sent: None,
            last_received_ack: None,
            duplicate_ack_count: 0,
            last_message_number: 0,
            pending_received_messages: BTreeMap::new(),
            has_received_handshake: false,
            has_received_handshake_ack: false,
            did_request_handshake: false,
            stats: ConnectionStats::default(),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Migrate the connection to a new peer address; in-flight state is preserved.
    pub fn update_destination(&mut self, destination: SocketAddr) {
        debug!(
            "connection destination changing {:?} -> {:?}",
            self.destination, destination
        );
        self.destination = destination;
        if let Some(queue) = &self.send_queue {
            queue.update_destination(destination);
        }
    }

    pub fn sample_stats(&mut self) -> ConnectionStats {
        self.stats.sample()
    }

    pub fn record_sent_unreliable_packet(&mut self, wire_size: usize) {
        self.stats.record_sent_unreliable_packet(wire_size);
    }

    pub fn record_received_unreliable_packet(&mut self, wire_size: usize) {
        self.stats.record_received_unreliable_packet(wire_size);
    }

    fn ensure_send_queue(&mut self) -> Arc<SendQueue> {
        if self.send_queue.is_none() {
            let queue = SendQueue::new(
                self.config.clone(),
                self.socket.clone(),
                self.destination,
                self.initial_sequence_number,
                self.last_message_number,
                self.has_received_handshake_ack,
                self.events_tx.clone(),
            );
            queue.set_flow_window_size(self.congestion.flow_window_size());
            queue.set_packet_send_period(self.congestion.packet_send_period());
            queue.set_estimated_timeout(self.congestion.estimated_timeout());
            self.send_queue = Some(queue);
        }
        self.send_queue.as_ref().unwrap().clone()
    }

    fn retire_send_queue(&mut self) {
        if let Some(queue) = self.send_queue.take() {
            self.last_message_number = queue.current_message_number();
            queue.stop();
        }
    }

    /// Enqueue a reliable packet; buffered until the handshake completes.
    pub fn send_reliable_packet(&mut self, packet: Packet) {
        debug_assert!(packet.is_reliable());
        self.ensure_send_queue().queue_packet(packet);
    }

    /// Enqueue a packet list on a fresh channel of the send queue.
    pub fn send_reliable_packet_list(&mut self, packet_list: PacketList) {
        debug_assert!(packet_list.is_reliable());
        self.ensure_send_queue().queue_packet_list(packet_list);
    }

    async fn write_control_packet(&mut self, packet: ControlPacket) {
        trace!("sending {:?} to {:?}", packet, self.destination);
        let mut buf = BytesMut::with_capacity(packet.data_size());
        packet.ser(&mut buf);
        self.socket.do_send_packet(self.destination, &buf).await;
    }

    /// Ask the peer for a fresh Handshake; used when reliable data arrives without
    ///  one, which means we missed it or the peer restarted.
    pub async fn send_handshake_request(&mut self) {
        self.did_request_handshake = true;
        self.write_control_packet(ControlPacket::HandshakeRequest)
            .await;
    }

    /// Track a received data packet's sequence number, maintaining the receive loss
    ///  list. Returns whether the packet should be processed further; duplicates are
    ///  dropped (and counted).
    pub async fn process_received_sequence_number(
        &mut self,
        sequence_number: SequenceNumber,
        wire_size: usize,
        _payload_size: usize,
    ) -> bool {
        if !self.has_received_handshake {
            // reliable data without the peer's initial sequence number is
            //  uninterpretable - ask for a handshake and drop the packet
            self.send_handshake_request().await;
            return false;
        }

        self.stats.record_received_packet(wire_size);
        self.congestion
            .on_packet_received(wire_size, sequence_number);

        let expected = self.last_received_sequence_number.next();
        if sequence_number == expected {
            self.last_received_sequence_number = sequence_number;
            true
        } else if expected.is_before(sequence_number) {
            trace!(
                "gap {:?}..={:?} from {:?}",
                expected,
                sequence_number - 1,
                self.destination
            );
            self.loss_list.insert(expected, sequence_number - 1);
            self.last_received_sequence_number = sequence_number;
            true
        } else if self.loss_list.remove(sequence_number) {
            true
        } else {
            trace!("duplicate {:?} from {:?}", sequence_number, self.destination);
            self.stats.record_duplicate_packet();
            false
        }
    }

    /// Slot a message-part packet into its collector and deliver every contiguous
    ///  packet from the front, removing the collector once its LAST packet is out.
    pub async fn queue_received_message_packet(&mut self, packet: Packet) {
        let message_number = packet.message_number();

        let mut deliverable = Vec::new();
        let mut completed = false;
        {
            let pending = self
                .pending_received_messages
                .entry(message_number)
                .or_default();
            pending.enqueue(packet);

            while let Some(next) = pending.remove_next_packet() {
                completed = next.position().is_final();
                deliverable.push(next);
                if completed {
                    break;
                }
            }
        }
        if completed {
            self.pending_received_messages.remove(&message_number);
        }

        if let Some(handler) = self.handlers.message_handler() {
            for packet in deliverable {
                handler.on_message_packet(packet).await;
            }
        }
    }

    /// Route a control packet. ACKs require a completed handshake; the handshake
    ///  packets themselves are always processed.
    pub async fn process_control(&mut self, packet: ControlPacket) {
        match packet {
            ControlPacket::Ack {
                next_sequence_number,
            } => self.process_ack(next_sequence_number).await,
            ControlPacket::Handshake {
                initial_sequence_number,
            } => self.process_handshake(initial_sequence_number).await,
            ControlPacket::HandshakeAck {
                initial_sequence_number,
            } => self.process_handshake_ack(initial_sequence_number),
            ControlPacket::HandshakeRequest => self.process_handshake_request(),
        }
    }

    async fn process_ack(&mut self, ack: SequenceNumber) {
        if !self.has_received_handshake_ack {
            return;
        }
        let Some(queue) = self.send_queue.clone() else {
            return;
        };

        // an ACK for sequence numbers we never sent is a protocol violation
        if queue.current_sequence_number().next().is_before(ack) {
            debug!(
                "ignoring ACK({}) beyond our last sent sequence number",
                ack
            );
            return;
        }

        self.stats.record_ack_processed();

        if let Some(last) = self.last_received_ack {
            if ack.is_before(last) {
                return;
            }
            if ack == last {
                self.duplicate_ack_count += 1;
                if self.duplicate_ack_count >= FAST_RETRANSMIT_ACK_COUNT {
                    debug!("{} duplicate ACKs for {} - fast retransmit", self.duplicate_ack_count, ack);
                    queue.fast_retransmit(ack);
                    self.congestion.on_loss(ack, ack);
                    self.push_congestion_outputs();
                    self.duplicate_ack_count = 0;
                }
                return;
            }
        }

        self.last_received_ack = Some(ack);
        self.duplicate_ack_count = 0;

        self.congestion.on_ack(ack, Instant::now());
        self.push_congestion_outputs();
        queue.ack(ack);
    }

    async fn process_handshake(&mut self, initial_sequence_number: SequenceNumber) {
        if !self.has_received_handshake
            || self.initial_receive_sequence_number != Some(initial_sequence_number)
        {
            if self.has_received_handshake {
                debug!(
                    "{:?} handshook again with a new initial sequence number - resetting receive state",
                    self.destination
                );
                self.reset_receive_state().await;
            }
            self.initial_receive_sequence_number = Some(initial_sequence_number);
            self.last_received_sequence_number = initial_sequence_number;
        }

        self.has_received_handshake = true;
        self.write_control_packet(ControlPacket::HandshakeAck {
            initial_sequence_number,
        })
        .await;

        if self.did_request_handshake {
            debug!("handshake with {:?} complete", self.destination);
            self.did_request_handshake = false;
        }
    }

    fn process_handshake_ack(&mut self, initial_sequence_number: SequenceNumber) {
        // the echoed number must match our current incarnation; a stale ACK from
        //  before a reset does not establish anything
        if initial_sequence_number == self.initial_sequence_number {
            self.has_received_handshake_ack = true;
            if let Some(queue) = &self.send_queue {
                queue.handshake_ack();
            }
        }
    }

    fn process_handshake_request(&mut self) {
        if self.has_received_handshake_ack {
            debug!(
                "{:?} requested a handshake on an established connection - resetting",
                self.destination
            );
            self.retire_send_queue();
            self.has_received_handshake_ack = false;
            self.initial_sequence_number = SequenceNumber::random();
            self.last_received_ack = None;
            self.duplicate_ack_count = 0;
        }

        // the pacing task sends (and re-sends) the Handshake until it is ACKed
        self.ensure_send_queue().start();
    }

    async fn reset_receive_state(&mut self) {
        self.fail_all_pending_messages().await;
        self.loss_list.clear();
        self.last_ack_sent = None;
        self.initial_receive_sequence_number = None;
    }

    async fn fail_pending_message(&mut self, message_number: MessageNumber) {
        if self.pending_received_messages.remove(&message_number).is_some() {
            debug!(
                "reliable message {} from {:?} failed",
                message_number, self.destination
            );
            if let Some(handler) = self.handlers.message_handler() {
                handler
                    .on_message_failure(self.destination, message_number)
                    .await;
            }
        }
    }

    async fn fail_all_pending_messages(&mut self) {
        let message_numbers = self
            .pending_received_messages
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        for message_number in message_numbers {
            self.fail_pending_message(message_number).await;
        }
    }

    /// Tear the connection down: the send queue stops, and every unfinished received
    ///  message is reported as failed.
    pub async fn teardown(&mut self) {
        self.retire_send_queue();
        self.fail_all_pending_messages().await;
    }

    fn push_congestion_outputs(&self) {
        if let Some(queue) = &self.send_queue {
            queue.set_flow_window_size(self.congestion.flow_window_size());
            queue.set_packet_send_period(self.congestion.packet_send_period());
            queue.set_estimated_timeout(self.congestion.estimated_timeout());
        }
    }

    /// The next sequence number to acknowledge: the first gap if packets are missing,
    ///  one past the newest received packet otherwise.
    fn next_ack(&self) -> SequenceNumber {
        self.loss_list
            .first()
            .unwrap_or_else(|| self.last_received_sequence_number.next())
    }

    async fn send_ack_if_needed(&mut self) {
        let next_ack = self.next_ack();
        if self.last_ack_sent == Some(next_ack) {
            return;
        }

        self.write_control_packet(ControlPacket::Ack {
            next_sequence_number: next_ack,
        })
        .await;
        self.last_ack_sent = Some(next_ack);
        self.stats.record_ack_sent();
    }

    async fn fail_stale_pending_messages(&mut self) {
        let stale = self
            .pending_received_messages
            .iter()
            .filter(|(_, pending)| pending.is_stale(self.config.pending_message_timeout))
            .map(|(&message_number, _)| message_number)
            .collect::<Vec<_>>();
        for message_number in stale {
            self.fail_pending_message(message_number).await;
        }
    }

    /// The periodic tick: consume send-queue events into stats and the congestion
    ///  controller, emit an ACK when the acknowledged position moved, and expire
    ///  stalled messages.
    pub async fn sync(&mut self) -> SyncOutcome {
        let mut outcome = SyncOutcome::Active;

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SendQueueEvent::Sent {
                    wire_size,
                    sequence_number,
                    sent_at,
                    ..
                } => {
                    self.stats.record_sent_packet(wire_size);
                    self.congestion
                        .on_packet_sent(wire_size, sequence_number, sent_at);
                }
                SendQueueEvent::Retransmitted { wire_size, .. } => {
                    self.stats.record_retransmission(wire_size);
                }
                SendQueueEvent::Inactive => {
                    self.retire_send_queue();
                    if self.pending_received_messages.is_empty() {
                        outcome = SyncOutcome::Inactive;
                    }
                }
                SendQueueEvent::Timeout => {
                    self.congestion.on_timeout();
                    self.retire_send_queue();
                }
            }
        }
        self.push_congestion_outputs();

        if self.has_received_handshake {
            self.send_ack_if_needed().await;
        }
        self.fail_stale_pending_messages().await;

        outcome
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(queue) = &self.send_queue {
            queue.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::VegasCongestionControl;
    use crate::message_dispatcher::MockMessageHandler;
    use crate::packet::PacketPosition;
    use crate::send_queue::SendQueueState;
    use crate::send_socket::MockSendSocket;
    use bytes::BufMut;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    fn destination() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn seq(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn permissive_socket() -> MockSendSocket {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().returning(|_, _| ());
        socket
            .expect_local_addr()
            .return_const(Some(SocketAddr::from(([1, 2, 3, 4], 8))));
        socket
    }

    fn new_connection(socket: MockSendSocket, handlers: Arc<HandlerRegistry>) -> Connection {
        Connection::new(
            Arc::new(SocketConfig::default()),
            Arc::new(socket),
            destination(),
            Box::new(VegasCongestionControl::new()),
            handlers,
        )
    }

    fn message_packet(
        message_number: MessageNumber,
        position: PacketPosition,
        part: u32,
        tag: u8,
    ) -> Packet {
        let mut packet = Packet::new_data(10, true, true);
        packet.payload_mut().put_u8(tag);
        packet.write_message(message_number, position, part);
        packet
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_receiver_path_tracks_sequence_numbers() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut connection =
                new_connection(permissive_socket(), Arc::new(HandlerRegistry::default()));
            connection.process_handshake(seq(100)).await;

            // in order
            assert!(connection.process_received_sequence_number(seq(101), 50, 10).await);
            assert_eq!(connection.last_received_sequence_number, seq(101));

            // a jump opens a gap
            assert!(connection.process_received_sequence_number(seq(104), 50, 10).await);
            assert_eq!(connection.loss_list.len(), 2);
            assert_eq!(connection.next_ack(), seq(102));

            // late arrivals close the gap
            assert!(connection.process_received_sequence_number(seq(102), 50, 10).await);
            assert!(connection.process_received_sequence_number(seq(103), 50, 10).await);
            assert!(connection.loss_list.is_empty());
            assert_eq!(connection.next_ack(), seq(105));

            // a replay is a duplicate
            assert!(!connection.process_received_sequence_number(seq(103), 50, 10).await);
            assert_eq!(connection.stats.duplicate_packets, 1);
        });
    }

    #[test]
    fn test_reliable_data_before_handshake_requests_one() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut socket = MockSendSocket::new();
            // HandshakeRequest: C=1, type=3
            socket
                .expect_do_send_packet()
                .withf(|addr, buf| {
                    addr == &destination() && buf == [0x80, 0x03, 0x00, 0x00].as_slice()
                })
                .times(1)
                .returning(|_, _| ());

            let mut connection = new_connection(socket, Arc::new(HandlerRegistry::default()));
            assert!(!connection.process_received_sequence_number(seq(5), 50, 10).await);
            assert!(connection.did_request_handshake);
        });
    }

    #[test]
    fn test_handshake_is_acknowledged() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut socket = MockSendSocket::new();
            // HandshakeACK echoing the peer's initial sequence number 0x64
            socket
                .expect_do_send_packet()
                .withf(|addr, buf| {
                    addr == &destination()
                        && buf == [0x80, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64].as_slice()
                })
                .times(1)
                .returning(|_, _| ());

            let mut connection = new_connection(socket, Arc::new(HandlerRegistry::default()));
            connection.process_handshake(seq(100)).await;

            assert!(connection.has_received_handshake);
            assert_eq!(connection.last_received_sequence_number, seq(100));
        });
    }

    #[test]
    fn test_sync_emits_ack_only_on_change() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut socket = MockSendSocket::new();
            let mut sequence = Sequence::new();
            // HandshakeACK first
            socket
                .expect_do_send_packet()
                .withf(|_, buf| buf[0] == 0x80 && buf[1] == 0x02)
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|_, _| ());
            // then exactly one ACK carrying 102
            socket
                .expect_do_send_packet()
                .withf(|addr, buf| {
                    addr == &destination()
                        && buf == [0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x66].as_slice()
                })
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|_, _| ());

            let mut connection = new_connection(socket, Arc::new(HandlerRegistry::default()));
            connection.process_handshake(seq(100)).await;

            connection.process_received_sequence_number(seq(101), 50, 10).await;
            connection.sync().await;
            assert_eq!(connection.stats.acks_sent, 1);

            // no new data: the same ACK is not repeated
            connection.sync().await;
            connection.sync().await;
            assert_eq!(connection.stats.acks_sent, 1);
        });
    }

    #[test]
    fn test_ordered_message_reassembly_out_of_order() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut handler = MockMessageHandler::new();
            let mut sequence = Sequence::new();
            for expected_part in 0..3u32 {
                handler
                    .expect_on_message_packet()
                    .withf(move |p| p.message_part_number() == expected_part)
                    .times(1)
                    .in_sequence(&mut sequence)
                    .returning(|_| ());
            }

            let handlers = Arc::new(HandlerRegistry::default());
            handlers.set_message_handler(Arc::new(handler));
            let mut connection = new_connection(permissive_socket(), handlers);

            // LAST arrives first and must be buffered
            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::Last, 2, 3))
                .await;
            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::Middle, 1, 2))
                .await;
            assert_eq!(connection.pending_received_messages.len(), 1);

            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::First, 0, 1))
                .await;
            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_single_packet_message_is_delivered_immediately() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut handler = MockMessageHandler::new();
            handler
                .expect_on_message_packet()
                .withf(|p| p.position() == PacketPosition::Only)
                .times(1)
                .returning(|_| ());

            let handlers = Arc::new(HandlerRegistry::default());
            handlers.set_message_handler(Arc::new(handler));
            let mut connection = new_connection(permissive_socket(), handlers);

            connection
                .queue_received_message_packet(message_packet(3, PacketPosition::Only, 0, 1))
                .await;
            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_duplicate_message_part_is_ignored() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut handler = MockMessageHandler::new();
            handler
                .expect_on_message_packet()
                .times(2)
                .returning(|_| ());

            let handlers = Arc::new(HandlerRegistry::default());
            handlers.set_message_handler(Arc::new(handler));
            let mut connection = new_connection(permissive_socket(), handlers);

            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::First, 0, 1))
                .await;
            // a replayed part that was already delivered is dropped
            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::First, 0, 1))
                .await;
            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::Last, 1, 2))
                .await;
            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_handshake_reset_fails_pending_messages() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut handler = MockMessageHandler::new();
            handler
                .expect_on_message_packet()
                .returning(|_| ());
            handler
                .expect_on_message_failure()
                .with(eq(destination()), eq(7u32))
                .times(1)
                .returning(|_, _| ());

            let handlers = Arc::new(HandlerRegistry::default());
            handlers.set_message_handler(Arc::new(handler));
            let mut connection = new_connection(permissive_socket(), handlers);

            connection.process_handshake(seq(100)).await;
            connection
                .queue_received_message_packet(message_packet(7, PacketPosition::First, 0, 1))
                .await;
            assert_eq!(connection.pending_received_messages.len(), 1);

            // a handshake with a different initial sequence number means the peer reset
            connection.process_handshake(seq(5000)).await;
            assert!(connection.pending_received_messages.is_empty());
            assert_eq!(connection.last_received_sequence_number, seq(5000));
        });
    }

    #[test]
    fn test_stale_pending_message_fails_on_sync() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut handler = MockMessageHandler::new();
            handler
                .expect_on_message_packet()
                .returning(|_| ());
            handler
                .expect_on_message_failure()
                .with(eq(destination()), eq(9u32))
                .times(1)
                .returning(|_, _| ());

            let handlers = Arc::new(HandlerRegistry::default());
            handlers.set_message_handler(Arc::new(handler));
            let mut connection = new_connection(permissive_socket(), handlers);

            connection
                .queue_received_message_packet(message_packet(9, PacketPosition::First, 0, 1))
                .await;

            sleep(Duration::from_secs(31)).await;
            connection.sync().await;
            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_handshake_request_resets_established_connection() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut connection =
                new_connection(permissive_socket(), Arc::new(HandlerRegistry::default()));

            // establish: queue data, peer ACKs our handshake
            let mut packet = Packet::new_data(10, true, false);
            packet.payload_mut().put_u8(1);
            connection.send_reliable_packet(packet);
            let initial = connection.initial_sequence_number;
            connection.process_handshake_ack(initial);
            assert!(connection.has_received_handshake_ack);

            let old_queue = connection.send_queue.clone().unwrap();

            connection.process_handshake_request();

            // the old queue is gone and the connection is no longer established
            assert_eq!(old_queue.state(), SendQueueState::Stopped);
            assert!(!connection.has_received_handshake_ack);
            let new_queue = connection.send_queue.clone().unwrap();
            assert!(!Arc::ptr_eq(&old_queue, &new_queue));
            assert!(!new_queue.has_received_handshake_ack());
        });
    }

    #[test]
    fn test_stale_handshake_ack_is_ignored() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut connection =
                new_connection(permissive_socket(), Arc::new(HandlerRegistry::default()));

            connection.process_handshake_ack(connection.initial_sequence_number + 1);
            assert!(!connection.has_received_handshake_ack);
        });
    }

    #[test]
    fn test_duplicate_acks_trigger_fast_retransmit() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut connection =
                new_connection(permissive_socket(), Arc::new(HandlerRegistry::default()));

            let mut packet = Packet::new_data(10, true, false);
            packet.payload_mut().put_u8(1);
            connection.send_reliable_packet(packet);
            let mut packet = Packet::new_data(10, true, false);
            packet.payload_mut().put_u8(2);
            connection.send_reliable_packet(packet);

            let initial = connection.initial_sequence_number;
            connection.process_handshake_ack(initial);

            // both packets go out
            let queue = connection.send_queue.clone().unwrap();
            while queue.pending_packet_count() < 2 {
                sleep(Duration::from_millis(5)).await;
            }

            // the peer keeps asking for the first packet
            let ack = initial + 1;
            connection.process_ack(ack).await;
            for _ in 0..FAST_RETRANSMIT_ACK_COUNT {
                connection.process_ack(ack).await;
            }

            // the retransmission surfaces as a send-queue event
            let mut retransmitted = false;
            for _ in 0..50 {
                sleep(Duration::from_millis(5)).await;
                connection.sync().await;
                if connection.stats.retransmitted_packets > 0 {
                    retransmitted = true;
                    break;
                }
            }
            assert!(retransmitted);
        });
    }

    #[test]
    fn test_ack_beyond_sent_is_dropped() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut connection =
                new_connection(permissive_socket(), Arc::new(HandlerRegistry::default()));

            let mut packet = Packet::new_data(10, true, false);
            packet.payload_mut().put_u8(1);
            connection.send_reliable_packet(packet);
            let initial = connection.initial_sequence_number;
            connection.process_handshake_ack(initial);

            connection.process_ack(initial + 1000).await;
            assert_eq!(connection.stats.acks_processed, 0);
        });
    }

    #[test]
    fn test_teardown_fails_pending_messages() {
        let rt = paused_runtime();
        rt.block_on(async {
            let mut handler = MockMessageHandler::new();
            handler
                .expect_on_message_packet()
                .returning(|_| ());
            handler
                .expect_on_message_failure()
                .with(eq(destination()), eq(4u32))
                .times(1)
                .returning(|_, _| ());

            let handlers = Arc::new(HandlerRegistry::default());
            handlers.set_message_handler(Arc::new(handler));
            let mut connection = new_connection(permissive_socket(), handlers);

            connection
                .queue_received_message_packet(message_packet(4, PacketPosition::First, 0, 1))
                .await;
            connection.teardown().await;
            assert!(connection.pending_received_messages.is_empty());
        });
    }
}
