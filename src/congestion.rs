use crate::sequence_number::SequenceNumber;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// The pluggable congestion algorithm driving a connection's send queue.
///
/// The connection feeds it send/receive/ACK/loss events and copies the three outputs
///  (`flow_window_size`, `packet_send_period`, `estimated_timeout`) into the send
///  queue after every update.
pub trait CongestionControl: Send + 'static {
    fn on_packet_sent(&mut self, wire_size: usize, sequence_number: SequenceNumber, sent_at: Instant);

    /// Receive-side bookkeeping; most algorithms ignore it.
    fn on_packet_received(&mut self, _wire_size: usize, _sequence_number: SequenceNumber) {}

    fn on_ack(&mut self, ack: SequenceNumber, now: Instant);

    fn on_loss(&mut self, start: SequenceNumber, end: SequenceNumber);

    fn on_timeout(&mut self);

    /// Maximum number of reliable packets in flight.
    fn flow_window_size(&self) -> u32;

    /// Interval between successive send attempts.
    fn packet_send_period(&self) -> Duration;

    /// How long the send queue waits for an ACK before declaring the peer gone.
    fn estimated_timeout(&self) -> Duration;
}

/// Creates one controller per connection.
pub type CongestionControlFactory = Box<dyn Fn() -> Box<dyn CongestionControl> + Send + Sync>;

const INITIAL_WINDOW: u32 = 16;
const MIN_WINDOW: u32 = 2;
const MAX_WINDOW: u32 = 8192;
const INITIAL_SEND_PERIOD: Duration = Duration::from_millis(1);
const INITIAL_ESTIMATED_TIMEOUT: Duration = Duration::from_secs(1);

const MIN_ESTIMATED_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_ESTIMATED_TIMEOUT: Duration = Duration::from_secs(5);

/// Vegas queue-occupancy targets, in packets.
const ALPHA: f64 = 2.0;
const BETA: f64 = 4.0;

/// A TCP-Vegas-style controller: it estimates how many of this connection's packets
///  sit queued in the network (`window * (rtt - base_rtt) / rtt`) and steers the flow
///  window to keep that occupancy between [ALPHA] and [BETA]. The pace interval
///  follows as one smoothed RTT spread over the window.
pub struct VegasCongestionControl {
    /// Send timestamps of fresh (never retransmitted) packets, keyed by raw sequence
    ///  number. Retransmitted packets are withdrawn so an ambiguous ACK cannot yield
    ///  an RTT sample.
    send_times: FxHashMap<u32, Instant>,

    base_rtt_us: f64,
    srtt_us: f64,
    rttvar_us: f64,
    rtt_samples: u64,

    window: u32,
    send_period: Duration,
    estimated_timeout: Duration,
}

impl Default for VegasCongestionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl VegasCongestionControl {
    pub fn new() -> VegasCongestionControl {
        VegasCongestionControl {
            send_times: FxHashMap::default(),
            base_rtt_us: f64::MAX,
            srtt_us: 0.0,
            rttvar_us: 0.0,
            rtt_samples: 0,
            window: INITIAL_WINDOW,
            send_period: INITIAL_SEND_PERIOD,
            estimated_timeout: INITIAL_ESTIMATED_TIMEOUT,
        }
    }

    fn record_rtt_sample(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as f64;
        self.rtt_samples += 1;

        if rtt_us < self.base_rtt_us {
            self.base_rtt_us = rtt_us;
        }

        // SRTT / RTTVAR per RFC 6298
        if self.rtt_samples == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us = 0.875 * self.srtt_us + 0.125 * rtt_us;
        }

        let timeout_us = self.srtt_us + 4.0 * self.rttvar_us;
        self.estimated_timeout = Duration::from_micros(timeout_us as u64)
            .clamp(MIN_ESTIMATED_TIMEOUT, MAX_ESTIMATED_TIMEOUT);

        let occupancy = self.window as f64 * (rtt_us - self.base_rtt_us) / rtt_us;
        if occupancy < ALPHA {
            self.window = (self.window + 1).min(MAX_WINDOW);
        } else if occupancy > BETA {
            self.window = (self.window - 1).max(MIN_WINDOW);
        }
        trace!(
            "rtt sample {}us, occupancy {:.2} packets -> window {}",
            rtt_us,
            occupancy,
            self.window
        );

        self.send_period = Duration::from_micros((self.srtt_us / self.window as f64) as u64);
    }
}

impl CongestionControl for VegasCongestionControl {
    fn on_packet_sent(&mut self, _wire_size: usize, sequence_number: SequenceNumber, sent_at: Instant) {
        self.send_times.insert(sequence_number.to_raw(), sent_at);
    }

    fn on_ack(&mut self, ack: SequenceNumber, now: Instant) {
        // the newest packet the cumulative ACK covers provides the RTT sample
        if let Some(sent_at) = self.send_times.remove(&(ack - 1).to_raw()) {
            self.record_rtt_sample(now.duration_since(sent_at));
        }

        self.send_times
            .retain(|&raw, _| !SequenceNumber::from_raw(raw).is_before(ack));
    }

    fn on_loss(&mut self, start: SequenceNumber, end: SequenceNumber) {
        for seq in start.to(end.next()) {
            self.send_times.remove(&seq.to_raw());
        }

        self.window = (self.window / 2).max(MIN_WINDOW);
        debug!("loss {:?}..={:?} -> window {}", start, end, self.window);
    }

    fn on_timeout(&mut self) {
        self.send_times.clear();
        self.window = MIN_WINDOW;
        debug!("ack timeout -> window reset to {}", self.window);
    }

    fn flow_window_size(&self) -> u32 {
        self.window
    }

    fn packet_send_period(&self) -> Duration {
        self.send_period
    }

    fn estimated_timeout(&self) -> Duration {
        self.estimated_timeout
    }
}
