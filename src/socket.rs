use crate::config::SocketConfig;
use crate::congestion::{CongestionControlFactory, VegasCongestionControl};
use crate::connection::{Connection, SyncOutcome};
use crate::control_packet::ControlPacket;
use crate::message_dispatcher::{
    ConnectionCreationFilter, DatagramHandler, HandlerRegistry, MessageHandler, PacketFilter,
    PacketHandler, SocketErrorHandler,
};
use crate::packet::{MessageNumber, ObfuscationLevel, Packet, WirePacket, MESSAGE_NUMBER_MODULUS};
use crate::packet_list::PacketList;
use crate::send_socket::{SendSocket, SharedUdpSocket};
use crate::sequence_number::SequenceNumber;
use crate::stats::ConnectionStats;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace};

/// This many receive errors in a row count as a persistent socket failure and are
///  surfaced through the socket-error handler; shorter streaks are retried silently.
const PERSISTENT_ERROR_THRESHOLD: u32 = 5;

/// Backoff between receive attempts after an error, so a broken socket cannot spin
///  the network task.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Tracks consecutive receive failures to tell a transient error (retried on the
///  next tick) from a persistent one (reported to the application).
#[derive(Default)]
struct ReceiveErrorStreak {
    consecutive: u32,
}

impl ReceiveErrorStreak {
    /// Returns true exactly when the streak crosses the persistent threshold.
    fn on_error(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive == PERSISTENT_ERROR_THRESHOLD
    }

    fn on_success(&mut self) {
        self.consecutive = 0;
    }
}

/// The transport's UDP endpoint: one socket shared by every peer, with incoming
///  datagrams demultiplexed by sender address onto per-peer [Connection]s.
///
/// The receive loop runs on its own task and is the only place receive-side parsing
///  happens; it also drives the periodic sync tick that emits ACKs and recomputes
///  congestion state. Application tasks interact through the `write_*` operations
///  and the registered handlers.
pub struct Socket {
    inner: Arc<SocketInner>,
    recv_task: JoinHandle<()>,
}

struct SocketInner {
    config: Arc<SocketConfig>,
    send_socket: Arc<SharedUdpSocket>,
    handlers: Arc<HandlerRegistry>,

    /// Mutated only on the network task; guarded for the write paths of application
    ///  tasks.
    connections: Mutex<FxHashMap<SocketAddr, Connection>>,

    /// Per-address raw-datagram handlers that bypass all connection processing.
    unfiltered_handlers: std::sync::Mutex<FxHashMap<SocketAddr, Arc<dyn DatagramHandler>>>,

    /// Sequence counters for the unreliable fast path, one per destination.
    unreliable_sequence_numbers: std::sync::Mutex<FxHashMap<SocketAddr, SequenceNumber>>,
    /// Message numbers for unreliable ordered packet lists.
    unreliable_message_number: std::sync::Mutex<MessageNumber>,

    congestion_factory: std::sync::Mutex<CongestionControlFactory>,
    rebind_notify: Notify,
}

impl Socket {
    /// Bind the transport to `addr` and start its network task.
    pub async fn bind(addr: SocketAddr, config: SocketConfig) -> anyhow::Result<Socket> {
        config.validate()?;

        let udp_socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(
            "bound transport socket to {:?}",
            UdpSocket::local_addr(&udp_socket)?
        );

        let inner = Arc::new(SocketInner {
            config: Arc::new(config),
            send_socket: Arc::new(SharedUdpSocket::new(udp_socket)),
            handlers: Arc::new(HandlerRegistry::default()),
            connections: Mutex::new(FxHashMap::default()),
            unfiltered_handlers: std::sync::Mutex::new(FxHashMap::default()),
            unreliable_sequence_numbers: std::sync::Mutex::new(FxHashMap::default()),
            unreliable_message_number: std::sync::Mutex::new(0),
            congestion_factory: std::sync::Mutex::new(Box::new(|| {
                Box::new(VegasCongestionControl::new())
            })),
            rebind_notify: Notify::new(),
        });

        let recv_task = tokio::spawn(inner.clone().recv_loop());

        Ok(Socket { inner, recv_task })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.send_socket.local_addr()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Bind a fresh UDP socket on `port` and switch all traffic over to it.
    ///  Connection state is preserved.
    pub async fn rebind(&self, port: u16) -> anyhow::Result<()> {
        let mut addr = UdpSocket::local_addr(&self.inner.send_socket.current())?;
        addr.set_port(port);

        let new_socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(
            "rebound transport socket to {:?}",
            UdpSocket::local_addr(&new_socket)?
        );
        self.inner.send_socket.replace(new_socket);
        self.inner.rebind_notify.notify_one();
        Ok(())
    }

    pub fn set_packet_handler(&self, handler: Arc<dyn PacketHandler>) {
        self.inner.handlers.set_packet_handler(handler);
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.set_message_handler(handler);
    }

    pub fn set_socket_error_handler(&self, handler: Arc<dyn SocketErrorHandler>) {
        self.inner.handlers.set_socket_error_handler(handler);
    }

    pub fn set_connection_creation_filter(&self, filter: Arc<dyn ConnectionCreationFilter>) {
        self.inner.handlers.set_connection_creation_filter(filter);
    }

    pub fn set_packet_filter(&self, filter: Arc<dyn PacketFilter>) {
        self.inner.handlers.set_packet_filter(filter);
    }

    /// Route every datagram from `sender_addr` to `handler`, bypassing connection
    ///  processing entirely.
    pub fn add_unfiltered_handler(&self, sender_addr: SocketAddr, handler: Arc<dyn DatagramHandler>) {
        self.inner
            .unfiltered_handlers
            .lock()
            .unwrap()
            .insert(sender_addr, handler);
    }

    pub fn remove_unfiltered_handler(&self, sender_addr: &SocketAddr) {
        self.inner
            .unfiltered_handlers
            .lock()
            .unwrap()
            .remove(sender_addr);
    }

    /// Replace the congestion controller used for connections created from now on.
    pub fn set_congestion_control_factory(&self, factory: CongestionControlFactory) {
        *self.inner.congestion_factory.lock().unwrap() = factory;
    }

    /// Fire-and-forget send of a control-level packet, with no connection side
    ///  effects. Data packets cannot be sent this way.
    pub async fn write_base_packet(&self, packet: &ControlPacket, addr: SocketAddr) {
        let mut buf = BytesMut::with_capacity(packet.data_size());
        packet.ser(&mut buf);
        self.inner.send_socket.do_send_packet(addr, &buf).await;
    }

    /// Send one packet. A reliable packet is enqueued on the destination's send
    ///  queue (which stamps its sequence number at transmit time); an unreliable
    ///  packet is stamped from the per-destination counter and sent immediately.
    pub async fn write_packet(&self, mut packet: Packet, addr: SocketAddr) {
        if packet.is_reliable() {
            let mut connections = self.inner.connections.lock().await;
            if let Some(connection) =
                self.inner
                    .find_or_create_connection(&mut connections, addr, true)
            {
                connection.send_reliable_packet(packet);
            }
            return;
        }

        packet.write_sequence_number(self.inner.next_unreliable_sequence_number(addr));
        let mut buf = BytesMut::with_capacity(packet.data_size());
        packet.ser(&mut buf);
        self.inner.send_socket.do_send_packet(addr, &buf).await;

        let mut connections = self.inner.connections.lock().await;
        if let Some(connection) =
            self.inner
                .find_or_create_connection(&mut connections, addr, true)
        {
            connection.record_sent_unreliable_packet(packet.wire_size());
        }
    }

    /// Send a packet list. Reliable lists open a new channel on the destination's
    ///  send queue; unreliable lists are stamped (with a message number if ordered)
    ///  and every packet sent immediately.
    pub async fn write_packet_list(&self, mut packet_list: PacketList, addr: SocketAddr) {
        if packet_list.is_reliable() {
            let mut connections = self.inner.connections.lock().await;
            if let Some(connection) =
                self.inner
                    .find_or_create_connection(&mut connections, addr, true)
            {
                connection.send_reliable_packet_list(packet_list);
            }
            return;
        }

        if packet_list.is_ordered() {
            packet_list.prepare_message(self.inner.next_unreliable_message_number());
        }
        for packet in packet_list.into_packets() {
            self.write_packet(packet, addr).await;
        }
    }

    /// Tear down the connection to `addr`, reporting unfinished received messages as
    ///  failed.
    pub async fn cleanup_connection(&self, addr: SocketAddr) {
        let connection = self.inner.connections.lock().await.remove(&addr);
        if let Some(mut connection) = connection {
            debug!("cleaning up connection to {:?}", addr);
            connection.teardown().await;
        }
    }

    pub async fn clear_connections(&self) {
        let connections = std::mem::take(&mut *self.inner.connections.lock().await);
        for (addr, mut connection) in connections {
            debug!("cleaning up connection to {:?}", addr);
            connection.teardown().await;
        }
    }

    /// Migrate a peer's connection and unreliable-sequence state to a new address,
    ///  preserving in-flight packets.
    pub async fn handle_remote_address_change(
        &self,
        previous_addr: SocketAddr,
        current_addr: SocketAddr,
    ) {
        {
            let mut connections = self.inner.connections.lock().await;
            if connections.contains_key(&current_addr) {
                debug!(
                    "not migrating {:?} -> {:?}: target already has a connection",
                    previous_addr, current_addr
                );
                return;
            }
            if let Some(mut connection) = connections.remove(&previous_addr) {
                connection.update_destination(current_addr);
                connections.insert(current_addr, connection);
            }
        }

        let mut unreliable = self.inner.unreliable_sequence_numbers.lock().unwrap();
        if let Some(seq) = unreliable.remove(&previous_addr) {
            unreliable.insert(current_addr, seq);
        }
    }

    pub async fn sample_stats_for_all_connections(&self) -> Vec<(SocketAddr, ConnectionStats)> {
        let mut connections = self.inner.connections.lock().await;
        connections
            .iter_mut()
            .map(|(addr, connection)| (*addr, connection.sample_stats()))
            .collect()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl SocketInner {
    fn next_unreliable_sequence_number(&self, addr: SocketAddr) -> SequenceNumber {
        let mut counters = self.unreliable_sequence_numbers.lock().unwrap();
        let counter = counters.entry(addr).or_insert_with(SequenceNumber::random);
        *counter = counter.next();
        *counter
    }

    fn next_unreliable_message_number(&self) -> MessageNumber {
        let mut counter = self.unreliable_message_number.lock().unwrap();
        *counter = (*counter + 1) % MESSAGE_NUMBER_MODULUS;
        *counter
    }

    fn find_or_create_connection<'a>(
        &self,
        connections: &'a mut FxHashMap<SocketAddr, Connection>,
        addr: SocketAddr,
        filter_creation: bool,
    ) -> Option<&'a mut Connection> {
        if !connections.contains_key(&addr) {
            if filter_creation && !self.handlers.allows_connection(&addr) {
                debug!("connection to {:?} denied by the creation filter", addr);
                return None;
            }

            debug!("creating connection to {:?}", addr);
            let congestion = (self.congestion_factory.lock().unwrap())();
            let send_socket: Arc<dyn SendSocket> = self.send_socket.clone();
            connections.insert(
                addr,
                Connection::new(
                    self.config.clone(),
                    send_socket,
                    addr,
                    congestion,
                    self.handlers.clone(),
                ),
            );
        }
        connections.get_mut(&addr)
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let mut sync_interval = interval(self.config.sync_interval);
        let mut buf = vec![0u8; self.config.max_datagram_size];
        let mut error_streak = ReceiveErrorStreak::default();

        loop {
            let socket = self.send_socket.current();
            select! {
                _ = sync_interval.tick() => {
                    self.sync_all_connections().await;
                }
                _ = self.rebind_notify.notified() => {
                    // pick up the replacement socket on the next iteration
                    error_streak.on_success();
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            error_streak.on_success();
                            self.handle_datagram(&buf[..len], from).await;
                        }
                        Err(e) => {
                            error!("socket receive error: {}", e);
                            if error_streak.on_error() {
                                if let Some(handler) = self.handlers.socket_error_handler() {
                                    handler.on_socket_error(e).await;
                                }
                            }
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        trace!("received {} bytes from {:?}", data.len(), from);

        let unfiltered = self.unfiltered_handlers.lock().unwrap().get(&from).cloned();
        if let Some(handler) = unfiltered {
            handler.on_datagram(data.to_vec(), from).await;
            return;
        }

        match WirePacket::parse(data, from) {
            Ok(WirePacket::Control(control)) => self.handle_control_packet(control, from).await,
            Ok(WirePacket::Data(packet)) => self.handle_data_packet(packet, from).await,
            Err(e) => debug!(
                "dropping unparseable {} byte datagram from {:?}: {}",
                data.len(),
                from,
                e
            ),
        }
    }

    async fn handle_control_packet(&self, control: ControlPacket, from: SocketAddr) {
        let mut connections = self.connections.lock().await;
        match self.find_or_create_connection(&mut connections, from, true) {
            Some(connection) => connection.process_control(control).await,
            None => trace!("dropping control packet from filtered peer {:?}", from),
        }
    }

    async fn handle_data_packet(&self, mut packet: Packet, from: SocketAddr) {
        if !self.handlers.allows_packet(&packet) {
            debug!("packet filter rejected a packet from {:?}", from);
            return;
        }

        if packet.obfuscation_level() != ObfuscationLevel::None {
            packet.obfuscate(ObfuscationLevel::None, &self.config.obfuscation);
        }

        if packet.is_reliable() {
            let mut connections = self.connections.lock().await;
            let Some(connection) = self.find_or_create_connection(&mut connections, from, true)
            else {
                return;
            };

            let accepted = connection
                .process_received_sequence_number(
                    packet.sequence_number(),
                    packet.wire_size(),
                    packet.payload().len(),
                )
                .await;
            if !accepted {
                return;
            }

            if packet.is_part_of_message() {
                connection.queue_received_message_packet(packet).await;
                return;
            }

            drop(connections);
            if let Some(handler) = self.handlers.packet_handler() {
                handler.on_packet(packet).await;
            }
        } else {
            // the unreliable fast path bypasses connection state entirely, but an
            //  existing connection still accounts for the traffic
            {
                let mut connections = self.connections.lock().await;
                if let Some(connection) = connections.get_mut(&from) {
                    connection.record_received_unreliable_packet(packet.wire_size());
                }
            }
            if let Some(handler) = self.handlers.packet_handler() {
                handler.on_packet(packet).await;
            }
        }
    }

    async fn sync_all_connections(&self) {
        let mut inactive = Vec::new();

        let mut connections = self.connections.lock().await;
        for (addr, connection) in connections.iter_mut() {
            if connection.sync().await == SyncOutcome::Inactive {
                inactive.push(*addr);
            }
        }
        for addr in inactive {
            debug!("connection to {:?} became inactive - cleaning up", addr);
            if let Some(mut connection) = connections.remove(&addr) {
                connection.teardown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ObfuscationTable, PacketPosition};
    use async_trait::async_trait;
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ChannelPacketHandler(mpsc::UnboundedSender<Packet>);

    #[async_trait]
    impl PacketHandler for ChannelPacketHandler {
        async fn on_packet(&self, packet: Packet) {
            let _ = self.0.send(packet);
        }
    }

    struct ChannelMessageHandler {
        packets: mpsc::UnboundedSender<Packet>,
        failures: mpsc::UnboundedSender<(SocketAddr, MessageNumber)>,
    }

    #[async_trait]
    impl MessageHandler for ChannelMessageHandler {
        async fn on_message_packet(&self, packet: Packet) {
            let _ = self.packets.send(packet);
        }

        async fn on_message_failure(&self, peer_addr: SocketAddr, message_number: MessageNumber) {
            let _ = self.failures.send((peer_addr, message_number));
        }
    }

    struct ChannelDatagramHandler(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl DatagramHandler for ChannelDatagramHandler {
        async fn on_datagram(&self, data: Vec<u8>, _sender_addr: SocketAddr) {
            let _ = self.0.send(data);
        }
    }

    struct RejectEveryone;

    impl ConnectionCreationFilter for RejectEveryone {
        fn allow_connection(&self, _peer_addr: &SocketAddr) -> bool {
            false
        }
    }

    async fn bound_socket() -> Socket {
        Socket::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            SocketConfig::default(),
        )
        .await
        .unwrap()
    }

    fn reliable_packet(payload: &[u8]) -> Packet {
        let mut packet = Packet::new_data(payload.len(), true, false);
        packet.payload_mut().put_slice(payload);
        packet
    }

    fn unreliable_packet(payload: &[u8]) -> Packet {
        let mut packet = Packet::new_data(payload.len(), false, false);
        packet.payload_mut().put_slice(payload);
        packet
    }

    const E2E_TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_reliable_packet_end_to_end() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(tx)));

        sender
            .write_packet(reliable_packet(b"over the top"), receiver_addr)
            .await;

        let received = timeout(E2E_TIMEOUT, rx.recv())
            .await
            .expect("no packet within the timeout")
            .unwrap();
        assert!(received.is_reliable());
        assert_eq!(received.payload(), b"over the top");
        assert_eq!(
            received.sender_addr(),
            Some(sender.local_addr().unwrap())
        );
    }

    #[tokio::test]
    async fn test_unreliable_packet_end_to_end() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(tx)));

        sender
            .write_packet(unreliable_packet(b"fire and forget"), receiver_addr)
            .await;

        let received = timeout(E2E_TIMEOUT, rx.recv())
            .await
            .expect("no packet within the timeout")
            .unwrap();
        assert!(!received.is_reliable());
        assert_eq!(received.payload(), b"fire and forget");
    }

    #[tokio::test]
    async fn test_unreliable_packets_are_sequenced_per_destination() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(tx)));

        for payload in [b"one", b"two"] {
            sender
                .write_packet(unreliable_packet(payload), receiver_addr)
                .await;
        }

        let first = timeout(E2E_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        let second = timeout(E2E_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            first.sequence_number().next(),
            second.sequence_number()
        );
    }

    #[tokio::test]
    async fn test_ordered_message_end_to_end() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (packets_tx, mut packets_rx) = mpsc::unbounded_channel();
        let (failures_tx, _failures_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler(Arc::new(ChannelMessageHandler {
            packets: packets_tx,
            failures: failures_tx,
        }));

        let mut list = PacketList::new(true, true);
        for chunk in [b"alpha", b"bravo", b"gamma"] {
            let mut packet = Packet::new_data(chunk.len(), true, true);
            packet.payload_mut().put_slice(chunk);
            list.push(packet);
        }
        sender.write_packet_list(list, receiver_addr).await;

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(
                timeout(E2E_TIMEOUT, packets_rx.recv())
                    .await
                    .expect("incomplete message within the timeout")
                    .unwrap(),
            );
        }

        assert_eq!(
            received.iter().map(|p| p.payload().to_vec()).collect::<Vec<_>>(),
            vec![b"alpha".to_vec(), b"bravo".to_vec(), b"gamma".to_vec()]
        );
        assert_eq!(
            received.iter().map(|p| p.position()).collect::<Vec<_>>(),
            vec![
                PacketPosition::First,
                PacketPosition::Middle,
                PacketPosition::Last
            ]
        );
        assert_eq!(
            received
                .iter()
                .map(|p| p.message_part_number())
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(received
            .windows(2)
            .all(|w| w[0].message_number() == w[1].message_number()));
        assert!(received
            .windows(2)
            .all(|w| w[0].sequence_number().next() == w[1].sequence_number()));
    }

    #[tokio::test]
    async fn test_obfuscated_payload_is_restored_on_receive() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(tx)));

        let mut packet = unreliable_packet(b"hidden in plain sight");
        packet.obfuscate(ObfuscationLevel::Level2, &ObfuscationTable::default());
        sender.write_packet(packet, receiver_addr).await;

        let received = timeout(E2E_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.obfuscation_level(), ObfuscationLevel::None);
        assert_eq!(received.payload(), b"hidden in plain sight");
    }

    #[tokio::test]
    async fn test_connection_creation_filter_blocks_reliable_traffic() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(tx)));
        // the receiver refuses to form connections, so the handshake never completes
        receiver.set_connection_creation_filter(Arc::new(RejectEveryone));

        sender
            .write_packet(reliable_packet(b"unwanted"), receiver_addr)
            .await;

        assert!(timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unfiltered_handler_sees_raw_datagrams() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();
        let sender_addr = sender.local_addr().unwrap();

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
        receiver.add_unfiltered_handler(sender_addr, Arc::new(ChannelDatagramHandler(raw_tx)));
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(packet_tx)));

        sender
            .write_packet(unreliable_packet(b"raw"), receiver_addr)
            .await;

        let raw = timeout(E2E_TIMEOUT, raw_rx.recv()).await.unwrap().unwrap();
        // header word plus payload, untouched by the transport
        assert_eq!(&raw[4..], b"raw");
        assert!(timeout(Duration::from_millis(300), packet_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stats_count_both_directions() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.set_packet_handler(Arc::new(ChannelPacketHandler(tx)));

        sender
            .write_packet(reliable_packet(b"counted"), receiver_addr)
            .await;
        timeout(E2E_TIMEOUT, rx.recv()).await.unwrap().unwrap();

        // give the sender a sync tick to fold send-queue events into its stats
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sender_stats = sender.sample_stats_for_all_connections().await;
        assert_eq!(sender_stats.len(), 1);
        assert_eq!(sender_stats[0].0, receiver_addr);
        assert!(sender_stats[0].1.sent_packets >= 1);

        let receiver_stats = receiver.sample_stats_for_all_connections().await;
        assert_eq!(receiver_stats.len(), 1);
        assert!(receiver_stats[0].1.received_packets >= 1);
    }

    #[tokio::test]
    async fn test_cleanup_connection_reports_message_failures() {
        let receiver = bound_socket().await;
        let peer_addr = SocketAddr::from(([127, 0, 0, 1], 4242));

        let (packets_tx, _packets_rx) = mpsc::unbounded_channel();
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler(Arc::new(ChannelMessageHandler {
            packets: packets_tx,
            failures: failures_tx,
        }));

        // drop a half-finished message into the connection by hand
        {
            let mut connections = receiver.inner.connections.lock().await;
            let connection = receiver
                .inner
                .find_or_create_connection(&mut connections, peer_addr, false)
                .unwrap();
            let mut packet = Packet::new_data(10, true, true);
            packet.payload_mut().put_u8(1);
            packet.write_message(12, PacketPosition::First, 0);
            connection.queue_received_message_packet(packet).await;
        }

        receiver.cleanup_connection(peer_addr).await;

        let (addr, message_number) = timeout(E2E_TIMEOUT, failures_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr, peer_addr);
        assert_eq!(message_number, 12);
        assert!(receiver.inner.connections.lock().await.is_empty());
    }

    #[test]
    fn test_error_streak_surfaces_only_persistent_failures() {
        let mut streak = ReceiveErrorStreak::default();

        for _ in 0..PERSISTENT_ERROR_THRESHOLD - 1 {
            assert!(!streak.on_error());
        }
        assert!(streak.on_error());
        // the same streak is not re-reported
        assert!(!streak.on_error());

        // a successful receive ends the streak
        streak.on_success();
        for _ in 0..PERSISTENT_ERROR_THRESHOLD - 1 {
            assert!(!streak.on_error());
        }
        assert!(streak.on_error());
    }

    #[tokio::test]
    async fn test_write_base_packet_has_no_connection_side_effects() {
        let sender = bound_socket().await;
        let receiver = bound_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();

        sender
            .write_base_packet(&ControlPacket::HandshakeRequest, receiver_addr)
            .await;

        assert!(sender.inner.connections.lock().await.is_empty());
    }
}
