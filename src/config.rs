use anyhow::bail;

use crate::packet_header::PacketHeader;
use crate::sequence::SequenceHistory;

/// All tunables of the reliability core, passed explicitly into each component.
///
/// There is deliberately no process-wide mutable state: two connections with different
///  configurations can coexist in the same process. The ack history width and the
///  smoothing factors are empirically tuned values and therefore configuration rather
///  than constants - but note that `ack_history_bits` affects the wire format, so both
///  peers of a connection must agree on it.
pub struct ReliabilityConfig {
    /// The packet size this transport assumes it can send without IP-level fragmentation.
    ///
    /// In an ideal world we would discover the path MTU, but there is enough uncertainty
    ///  involved (optional IP headers introduced by some network hardware, tunnels) that
    ///  the responsibility is left with the application. With full Ethernet frames and no
    ///  optional headers this is `1500 - 20 - 8 = 1472` for IPV4.
    pub max_packet_size_bytes: usize,

    /// Per-packet overhead of the underlying transport (UDP + IP headers), counted when
    ///  aggregating bandwidth statistics. 28 bytes for UDP over IPV4.
    pub transport_overhead_bytes: usize,

    /// Bits reserved at the end of each packet for the outer transport's trailer (e.g. a
    ///  termination bit added by a packet handler). Never available to payload.
    pub trailer_bits: usize,

    /// Width of the ack history bitfield in packet headers, i.e. how many packets
    ///  preceding the newest acknowledged one each header reports on. Bounds the
    ///  worst-case loss detection latency: a packet whose bit falls off this window
    ///  without ever being set is conclusively lost.
    pub ack_history_bits: u16,

    /// Maximum number of unacknowledged reliable messages held per channel. Reaching this
    ///  limit surfaces as `ReliableBufferFull` backpressure on `send_reliable`.
    pub reliable_buffer_capacity: usize,

    /// Whether successive small unreliable writes may be merged into the previous message
    ///  frame of the current packet instead of paying the framing overhead again.
    pub allow_merge: bool,

    /// Weight of a new sample in the exponentially smoothed jitter average, in `(0, 1]`.
    pub jitter_smoothing_factor: f64,

    /// A gap between received packets longer than this resets the jitter average instead
    ///  of smoothing across the stall. Must be shorter than the 1024 ms period of the
    ///  wire-level jitter clock, otherwise send deltas become ambiguous.
    pub jitter_reset_gap_ms: u64,

    /// Length of one statistics accumulation window.
    pub stats_period_ms: u64,

    /// Number of statistics windows the loss percentage is averaged over. Smoothing over
    ///  a few windows keeps single-window spikes from dominating congestion decisions.
    pub loss_window_count: usize,
}

impl ReliabilityConfig {
    /// defaults for IPV4 with end-to-end full Ethernet MTU and no optional headers
    pub fn default_ipv4() -> ReliabilityConfig {
        ReliabilityConfig {
            max_packet_size_bytes: 1472,
            transport_overhead_bytes: 28,
            trailer_bits: 1,
            ack_history_bits: 256,
            reliable_buffer_capacity: 512,
            allow_merge: true,
            jitter_smoothing_factor: 0.05,
            jitter_reset_gap_ms: 1000,
            stats_period_ms: 1000,
            loss_window_count: 4,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_history_bits == 0 || self.ack_history_bits as usize > SequenceHistory::MAX_BITS {
            bail!(
                "ack history width must be in 1..={}, was {}",
                SequenceHistory::MAX_BITS,
                self.ack_history_bits
            );
        }
        if self.max_packet_size_bytes * 8
            < PacketHeader::max_serialized_bits(self.ack_history_bits) + self.trailer_bits + 64
        {
            bail!("max packet size of {} bytes leaves no room for payload", self.max_packet_size_bytes);
        }
        if self.reliable_buffer_capacity == 0 {
            bail!("reliable buffer capacity must be positive");
        }
        if !(self.jitter_smoothing_factor > 0.0 && self.jitter_smoothing_factor <= 1.0) {
            bail!("jitter smoothing factor must be in (0, 1], was {}", self.jitter_smoothing_factor);
        }
        if self.jitter_reset_gap_ms >= PacketHeader::JITTER_CLOCK_MODULO_MS {
            bail!(
                "jitter reset gap must be below the {} ms jitter clock period, was {}",
                PacketHeader::JITTER_CLOCK_MODULO_MS,
                self.jitter_reset_gap_ms
            );
        }
        if self.stats_period_ms == 0 {
            bail!("stats period must be positive");
        }
        if self.loss_window_count == 0 {
            bail!("loss window count must be positive");
        }
        Ok(())
    }

    /// The bit budget available to payload in a single packet: total packet bits minus the
    ///  worst-case header size and the reserved trailer. This ceiling is enforced by the
    ///  packet builder and must never be exceeded.
    pub fn max_payload_bits(&self) -> usize {
        self.max_packet_size_bytes * 8
            - PacketHeader::max_serialized_bits(self.ack_history_bits)
            - self.trailer_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ReliabilityConfig::default_ipv4().validate().is_ok());
    }

    #[rstest]
    #[case::history_zero(|c: &mut ReliabilityConfig| c.ack_history_bits = 0)]
    #[case::history_too_wide(|c: &mut ReliabilityConfig| c.ack_history_bits = 257)]
    #[case::packet_too_small(|c: &mut ReliabilityConfig| c.max_packet_size_bytes = 20)]
    #[case::no_reliable_capacity(|c: &mut ReliabilityConfig| c.reliable_buffer_capacity = 0)]
    #[case::smoothing_zero(|c: &mut ReliabilityConfig| c.jitter_smoothing_factor = 0.0)]
    #[case::smoothing_above_one(|c: &mut ReliabilityConfig| c.jitter_smoothing_factor = 1.5)]
    #[case::reset_gap_too_long(|c: &mut ReliabilityConfig| c.jitter_reset_gap_ms = 1024)]
    #[case::stats_period_zero(|c: &mut ReliabilityConfig| c.stats_period_ms = 0)]
    #[case::no_loss_windows(|c: &mut ReliabilityConfig| c.loss_window_count = 0)]
    fn test_validate_rejects(#[case] break_config: fn(&mut ReliabilityConfig)) {
        let mut config = ReliabilityConfig::default_ipv4();
        break_config(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_payload_bits_accounts_for_header_and_trailer() {
        let config = ReliabilityConfig::default_ipv4();
        assert_eq!(
            config.max_payload_bits(),
            1472 * 8 - PacketHeader::max_serialized_bits(256) - 1
        );
    }
}
