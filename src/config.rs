use crate::packet::{ObfuscationTable, MAX_DATAGRAM_SIZE};
use anyhow::bail;
use std::time::Duration;

/// Transport tunables, validated once when the socket is created.
///
/// The defaults target interactive traffic on ordinary links; deployments on
///  constrained or long-fat paths are expected to adjust the timeouts and clamps.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Largest UDP payload the transport will produce. The default assumes standard
    ///  Ethernet frames without optional IP headers; the transport never fragments.
    pub max_datagram_size: usize,

    /// Period of the sync tick driving ACK emission and congestion recomputation.
    pub sync_interval: Duration,

    /// How long a sender waits for a HandshakeACK before re-sending its Handshake.
    pub handshake_resend_interval: Duration,

    /// A send queue with nothing queued and nothing awaiting ACK for this long shuts
    ///  itself down.
    pub inactivity_timeout: Duration,

    /// Clamp bounds for the congestion controller's estimated timeout.
    pub min_estimated_timeout: Duration,
    pub max_estimated_timeout: Duration,

    /// A partially received reliable message that makes no progress for this long is
    ///  reported through the message-failure handler and dropped.
    pub pending_message_timeout: Duration,

    /// Payload transforms for the header's obfuscation levels, copied into every
    ///  connection.
    pub obfuscation: ObfuscationTable,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            sync_interval: Duration::from_millis(10),
            handshake_resend_interval: Duration::from_millis(100),
            inactivity_timeout: Duration::from_secs(5),
            min_estimated_timeout: Duration::from_millis(250),
            max_estimated_timeout: Duration::from_secs(5),
            pending_message_timeout: Duration::from_secs(30),
            obfuscation: ObfuscationTable::default(),
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 100 {
            bail!("datagram size {} is too small", self.max_datagram_size);
        }
        if self.max_datagram_size > MAX_DATAGRAM_SIZE {
            bail!(
                "datagram size {} exceeds the {} byte MTU budget",
                self.max_datagram_size,
                MAX_DATAGRAM_SIZE
            );
        }
        if self.sync_interval.is_zero() {
            bail!("sync interval must be positive");
        }
        if self.handshake_resend_interval.is_zero() {
            bail!("handshake resend interval must be positive");
        }
        if self.inactivity_timeout.is_zero() {
            bail!("inactivity timeout must be positive");
        }
        if self.min_estimated_timeout.is_zero()
            || self.max_estimated_timeout < self.min_estimated_timeout
        {
            bail!("estimated timeout clamp bounds must be positive and ordered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(SocketConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_datagram(|c: &mut SocketConfig| c.max_datagram_size = 50)]
    #[case::oversized_datagram(|c: &mut SocketConfig| c.max_datagram_size = 9000)]
    #[case::zero_sync(|c: &mut SocketConfig| c.sync_interval = Duration::ZERO)]
    #[case::zero_handshake(|c: &mut SocketConfig| c.handshake_resend_interval = Duration::ZERO)]
    #[case::zero_inactivity(|c: &mut SocketConfig| c.inactivity_timeout = Duration::ZERO)]
    #[case::zero_min_timeout(|c: &mut SocketConfig| c.min_estimated_timeout = Duration::ZERO)]
    #[case::inverted_clamp(|c: &mut SocketConfig| {
        c.min_estimated_timeout = Duration::from_secs(10);
        c.max_estimated_timeout = Duration::from_secs(1);
    })]
    fn test_invalid_configs_are_rejected(#[case] break_it: fn(&mut SocketConfig)) {
        let mut config = SocketConfig::default();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
