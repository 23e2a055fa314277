use crate::config::SocketConfig;
use crate::control_packet::ControlPacket;
use crate::loss_list::LossList;
use crate::packet::{MessageNumber, Packet};
use crate::packet_list::PacketList;
use crate::packet_queue::PacketQueue;
use crate::send_socket::SendSocket;
use crate::sequence_number::SequenceNumber;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How long the pacing loop sleeps when it has nothing to send and nothing woke it,
///  bounding the latency of the inactivity and ACK-timeout checks.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Notifications the send queue posts to its owning connection.
#[derive(Debug)]
pub enum SendQueueEvent {
    Sent {
        wire_size: usize,
        payload_size: usize,
        sequence_number: SequenceNumber,
        sent_at: Instant,
    },
    Retransmitted {
        wire_size: usize,
        payload_size: usize,
        sequence_number: SequenceNumber,
        sent_at: Instant,
    },
    /// Nothing to send and nothing awaiting ACK for the configured interval; the
    ///  queue has shut itself down.
    Inactive,
    /// No ACK within the estimated timeout; the queue has shut itself down.
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendQueueState {
    NotStarted,
    Running,
    Stopped,
}

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// The per-connection sender.
///
/// A pacing task drains the packet queue at the congestion-controlled rate, gives
///  retransmissions priority over fresh sends, and stamps sequence numbers at the
///  moment a packet is committed to the wire. Reliable payload queued before the
///  peer confirmed our handshake is buffered, not transmitted; the pacing task keeps
///  re-sending the Handshake until the HandshakeACK arrives or the queue is stopped.
///
/// All public operations may be called from any task; they update state under
///  fine-grained locks and wake the pacing task through notifiers.
pub struct SendQueue {
    config: Arc<SocketConfig>,
    socket: Arc<dyn SendSocket>,
    destination: Mutex<SocketAddr>,

    initial_sequence_number: SequenceNumber,
    packets: Mutex<PacketQueue>,

    /// Reliable packets awaiting ACK: raw sequence number -> (resend count, packet).
    sent_packets: RwLock<FxHashMap<u32, (u8, Packet)>>,
    /// Sequence numbers pending retransmission.
    naks: Mutex<LossList>,

    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,

    /// Last assigned sequence number, mirrored atomically for lock-free reads from
    ///  other tasks.
    current_sequence_number: AtomicU32,
    /// The next sequence number the peer expects (everything below is ACKed).
    last_ack: AtomicU32,
    last_ack_at: Mutex<Instant>,

    flow_window_size: AtomicU32,
    packet_send_period_us: AtomicU64,
    estimated_timeout_us: AtomicU64,

    has_received_handshake_ack: AtomicBool,
    handshake_notify: Notify,
    wake: Notify,

    events: mpsc::UnboundedSender<SendQueueEvent>,
}

impl SendQueue {
    pub fn new(
        config: Arc<SocketConfig>,
        socket: Arc<dyn SendSocket>,
        destination: SocketAddr,
        initial_sequence_number: SequenceNumber,
        initial_message_number: MessageNumber,
        has_received_handshake_ack: bool,
        events: mpsc::UnboundedSender<SendQueueEvent>,
    ) -> Arc<SendQueue> {
        Arc::new(SendQueue {
            config,
            socket,
            destination: Mutex::new(destination),
            initial_sequence_number,
            packets: Mutex::new(PacketQueue::new(initial_message_number)),
            sent_packets: RwLock::new(FxHashMap::default()),
            naks: Mutex::new(LossList::new()),
            state: AtomicU8::new(STATE_NOT_STARTED),
            task: Mutex::new(None),
            current_sequence_number: AtomicU32::new(initial_sequence_number.to_raw()),
            last_ack: AtomicU32::new(initial_sequence_number.next().to_raw()),
            last_ack_at: Mutex::new(Instant::now()),
            flow_window_size: AtomicU32::new(16),
            packet_send_period_us: AtomicU64::new(1_000),
            estimated_timeout_us: AtomicU64::new(1_000_000),
            has_received_handshake_ack: AtomicBool::new(has_received_handshake_ack),
            handshake_notify: Notify::new(),
            wake: Notify::new(),
            events,
        })
    }

    pub fn state(&self) -> SendQueueState {
        match self.state.load(Ordering::Acquire) {
            STATE_NOT_STARTED => SendQueueState::NotStarted,
            STATE_RUNNING => SendQueueState::Running,
            _ => SendQueueState::Stopped,
        }
    }

    fn set_state(&self, state: SendQueueState) {
        let raw = match state {
            SendQueueState::NotStarted => STATE_NOT_STARTED,
            SendQueueState::Running => STATE_RUNNING,
            SendQueueState::Stopped => STATE_STOPPED,
        };
        self.state.store(raw, Ordering::Release);
    }

    /// Enqueue a standalone packet, starting the pacing task if necessary.
    pub fn queue_packet(self: &Arc<Self>, packet: Packet) {
        self.packets.lock().unwrap().queue_packet(packet);
        self.start();
        self.wake.notify_one();
    }

    /// Enqueue a packet list as a new channel, starting the pacing task if necessary.
    pub fn queue_packet_list(self: &Arc<Self>, packet_list: PacketList) {
        self.packets.lock().unwrap().queue_packet_list(packet_list);
        self.start();
        self.wake.notify_one();
    }

    /// Start the pacing task. Idempotent; a stopped queue stays stopped.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if self.state() == SendQueueState::NotStarted && task.is_none() {
            self.set_state(SendQueueState::Running);
            let this = self.clone();
            *task = Some(tokio::spawn(this.run()));
        }
    }

    /// Stop the pacing task. Unsent and unACKed reliable packets are dropped.
    pub fn stop(&self) {
        self.set_state(SendQueueState::Stopped);
        self.handshake_notify.notify_one();
        self.wake.notify_one();
    }

    /// Cumulative ACK: every sequence number strictly below `ack` is acknowledged.
    ///  Replaying the current ACK is a no-op; a regressive ACK is ignored.
    pub fn ack(&self, ack: SequenceNumber) {
        let last_ack = SequenceNumber::from_raw(self.last_ack.load(Ordering::Acquire));
        if !last_ack.is_before(ack) {
            return;
        }

        {
            let mut sent = self.sent_packets.write().unwrap();
            for seq in last_ack.to(ack) {
                sent.remove(&seq.to_raw());
            }
        }
        self.naks.lock().unwrap().remove_before(ack);

        self.last_ack.store(ack.to_raw(), Ordering::Release);
        *self.last_ack_at.lock().unwrap() = Instant::now();
        self.wake.notify_one();
    }

    /// Schedule a retransmission for `seq` if it is still awaiting ACK.
    pub fn fast_retransmit(&self, seq: SequenceNumber) {
        if self.sent_packets.read().unwrap().contains_key(&seq.to_raw()) {
            self.naks.lock().unwrap().insert_one(seq);
            self.wake.notify_one();
        }
    }

    /// The peer confirmed our initial sequence number; reliable payload may flow.
    pub fn handshake_ack(&self) {
        self.has_received_handshake_ack
            .store(true, Ordering::Release);
        *self.last_ack_at.lock().unwrap() = Instant::now();
        self.handshake_notify.notify_one();
        self.wake.notify_one();
    }

    pub fn has_received_handshake_ack(&self) -> bool {
        self.has_received_handshake_ack.load(Ordering::Acquire)
    }

    pub fn update_destination(&self, destination: SocketAddr) {
        *self.destination.lock().unwrap() = destination;
    }

    /// The last sequence number assigned to an outgoing packet.
    pub fn current_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::from_raw(self.current_sequence_number.load(Ordering::Acquire))
    }

    pub fn current_message_number(&self) -> MessageNumber {
        self.packets.lock().unwrap().current_message_number()
    }

    /// Number of reliable packets sent but not yet acknowledged.
    pub fn pending_packet_count(&self) -> usize {
        self.sent_packets.read().unwrap().len()
    }

    pub fn set_flow_window_size(&self, window: u32) {
        self.flow_window_size.store(window, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn set_packet_send_period(&self, period: Duration) {
        self.packet_send_period_us
            .store(period.as_micros() as u64, Ordering::Release);
    }

    pub fn set_estimated_timeout(&self, timeout: Duration) {
        let clamped = timeout.clamp(
            self.config.min_estimated_timeout,
            self.config.max_estimated_timeout,
        );
        self.estimated_timeout_us
            .store(clamped.as_micros() as u64, Ordering::Release);
    }

    fn packet_send_period(&self) -> Duration {
        Duration::from_micros(self.packet_send_period_us.load(Ordering::Acquire))
    }

    fn estimated_timeout(&self) -> Duration {
        Duration::from_micros(self.estimated_timeout_us.load(Ordering::Acquire))
    }

    fn inflight_count(&self) -> u32 {
        let last_ack = SequenceNumber::from_raw(self.last_ack.load(Ordering::Acquire));
        last_ack.forward_distance(self.current_sequence_number().next())
    }

    fn is_flow_window_full(&self) -> bool {
        self.inflight_count() >= self.flow_window_size.load(Ordering::Acquire)
    }

    /// Increment the sequence counter and return the new value. Only called from the
    ///  pacing task.
    fn next_sequence_number(&self) -> SequenceNumber {
        let next = self.current_sequence_number().next();
        self.current_sequence_number
            .store(next.to_raw(), Ordering::Release);
        next
    }

    fn destination(&self) -> SocketAddr {
        *self.destination.lock().unwrap()
    }

    async fn run(self: Arc<Self>) {
        debug!("send queue for {:?} starting", self.destination());

        let mut last_send: Option<Instant> = None;
        let mut idle_since = Instant::now();

        loop {
            if self.state() == SendQueueState::Stopped {
                break;
            }

            if !self.has_received_handshake_ack() {
                self.send_handshake().await;
                let _ = tokio::time::timeout(
                    self.config.handshake_resend_interval,
                    self.handshake_notify.notified(),
                )
                .await;
                continue;
            }

            let sent = if self.maybe_resend_packet().await {
                true
            } else {
                self.maybe_send_new_packet().await
            };
            if sent {
                last_send = Some(Instant::now());
                idle_since = Instant::now();
            }

            if !self.sent_packets.read().unwrap().is_empty() {
                // awaiting ACKs: the queue is not idle, but the peer must stay alive
                idle_since = Instant::now();

                let since_last_ack = self.last_ack_at.lock().unwrap().elapsed();
                if since_last_ack > self.estimated_timeout() {
                    debug!(
                        "no ACK from {:?} for {:?} - shutting down",
                        self.destination(),
                        since_last_ack
                    );
                    let _ = self.events.send(SendQueueEvent::Timeout);
                    self.set_state(SendQueueState::Stopped);
                    break;
                }
            } else if self.packets.lock().unwrap().is_empty() {
                if idle_since.elapsed() >= self.config.inactivity_timeout {
                    debug!("send queue for {:?} is inactive", self.destination());
                    let _ = self.events.send(SendQueueEvent::Inactive);
                    self.set_state(SendQueueState::Stopped);
                    break;
                }
            } else {
                idle_since = Instant::now();
            }

            if sent {
                let deadline = last_send.unwrap() + self.packet_send_period();
                select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.wake.notified() => {}
                }
            } else {
                let _ = tokio::time::timeout(IDLE_POLL_INTERVAL, self.wake.notified()).await;
            }
        }

        debug!("send queue for {:?} exited", self.destination());
    }

    async fn send_handshake(&self) {
        let handshake = ControlPacket::Handshake {
            initial_sequence_number: self.initial_sequence_number,
        };
        let mut buf = BytesMut::with_capacity(handshake.data_size());
        handshake.ser(&mut buf);

        let destination = self.destination();
        trace!("sending {:?} to {:?}", handshake, destination);
        self.socket.do_send_packet(destination, &buf).await;
    }

    /// Retransmit the smallest pending loss-list entry, skipping entries that were
    ///  ACKed in the meantime. Returns whether a packet went out.
    async fn maybe_resend_packet(&self) -> bool {
        loop {
            let seq = self.naks.lock().unwrap().pop_first();
            let Some(seq) = seq else {
                return false;
            };

            let prepared = {
                let mut sent = self.sent_packets.write().unwrap();
                match sent.get_mut(&seq.to_raw()) {
                    Some((resend_count, packet)) => {
                        *resend_count += 1;
                        packet.write_sequence_number(seq);
                        let mut buf = BytesMut::with_capacity(packet.data_size());
                        packet.ser(&mut buf);
                        Some((buf, packet.wire_size(), packet.payload().len()))
                    }
                    None => None,
                }
            };

            match prepared {
                Some((buf, wire_size, payload_size)) => {
                    let destination = self.destination();
                    self.socket.do_send_packet(destination, &buf).await;
                    trace!("retransmitted {:?} to {:?}", seq, destination);

                    let _ = self.events.send(SendQueueEvent::Retransmitted {
                        wire_size,
                        payload_size,
                        sequence_number: seq,
                        sent_at: Instant::now(),
                    });
                    return true;
                }
                None => {
                    trace!("loss-list entry {:?} was ACKed in the meantime", seq);
                }
            }
        }
    }

    /// Send one fresh packet if the flow window allows and the queue has one.
    async fn maybe_send_new_packet(&self) -> bool {
        if self.is_flow_window_full() {
            return false;
        }

        let packet = self.packets.lock().unwrap().take_packet();
        let Some(mut packet) = packet else {
            return false;
        };

        let seq = self.next_sequence_number();
        packet.write_sequence_number(seq);

        let mut buf = BytesMut::with_capacity(packet.data_size());
        packet.ser(&mut buf);
        let wire_size = packet.wire_size();
        let payload_size = packet.payload().len();

        if packet.is_reliable() {
            self.sent_packets
                .write()
                .unwrap()
                .insert(seq.to_raw(), (0, packet));
        }

        let destination = self.destination();
        self.socket.do_send_packet(destination, &buf).await;
        trace!("sent {:?} to {:?}", seq, destination);

        let _ = self.events.send(SendQueueEvent::Sent {
            wire_size,
            payload_size,
            sequence_number: seq,
            sent_at: Instant::now(),
        });
        true
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}
