/// Per-connection traffic counters.
///
/// Counters accumulate between calls to [ConnectionStats::sample], which returns the
///  interval's numbers and resets them, so callers can derive rates from periodic
///  sampling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub sent_packets: u64,
    pub received_packets: u64,
    pub retransmitted_packets: u64,
    pub duplicate_packets: u64,

    pub sent_unreliable_packets: u64,
    pub received_unreliable_packets: u64,

    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub sent_unreliable_bytes: u64,
    pub received_unreliable_bytes: u64,

    pub acks_sent: u64,
    pub acks_processed: u64,
}

impl ConnectionStats {
    pub fn record_sent_packet(&mut self, wire_size: usize) {
        self.sent_packets += 1;
        self.sent_bytes += wire_size as u64;
    }

    pub fn record_received_packet(&mut self, wire_size: usize) {
        self.received_packets += 1;
        self.received_bytes += wire_size as u64;
    }

    pub fn record_retransmission(&mut self, wire_size: usize) {
        self.retransmitted_packets += 1;
        self.sent_bytes += wire_size as u64;
    }

    pub fn record_duplicate_packet(&mut self) {
        self.duplicate_packets += 1;
    }

    pub fn record_sent_unreliable_packet(&mut self, wire_size: usize) {
        self.sent_unreliable_packets += 1;
        self.sent_unreliable_bytes += wire_size as u64;
    }

    pub fn record_received_unreliable_packet(&mut self, wire_size: usize) {
        self.received_unreliable_packets += 1;
        self.received_unreliable_bytes += wire_size as u64;
    }

    pub fn record_ack_sent(&mut self) {
        self.acks_sent += 1;
    }

    pub fn record_ack_processed(&mut self) {
        self.acks_processed += 1;
    }

    /// Return the counters accumulated since the previous sample and reset them.
    pub fn sample(&mut self) -> ConnectionStats {
        std::mem::take(self)
    }
}
