use tracing::debug;

use crate::rolling_data::RollingData;

/// Aggregated traffic statistics for one closed accumulation window.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionStatsSnapshot {
    /// actual length of the closed window, may exceed the configured period when ticks
    ///  are sparse
    pub window_ms: u64,

    pub out_packets: u64,
    pub out_bytes: u64,
    pub in_packets: u64,
    pub in_bytes: u64,

    pub out_packets_per_second: f64,
    pub out_bytes_per_second: f64,
    pub in_packets_per_second: f64,
    pub in_bytes_per_second: f64,

    /// dispositions of our sent packets that became known during the window
    pub packets_delivered: u64,
    pub packets_lost: u64,

    /// share of sent packets reported lost, in percent, averaged over the last few
    ///  windows so a single bad window does not dominate
    pub loss_percentage: f64,
}

/// Windowed accumulation of per-connection traffic counters.
///
/// Counters accumulate until `tick` finds the configured period elapsed, at which point
///  the window is closed into a snapshot and the counters restart. The loss percentage
///  is the only derived value with memory across windows: it is smoothed over the last
///  `loss_window_count` windows because per-window loss of a moderately loaded
///  connection is too noisy to act on directly.
pub struct ConnectionStatsAggregator {
    stats_period_ms: u64,
    window_start_ms: u64,

    out_packets: u64,
    out_bytes: u64,
    in_packets: u64,
    in_bytes: u64,
    packets_delivered: u64,
    packets_lost: u64,

    smoothed_loss: RollingData,
}

impl ConnectionStatsAggregator {
    pub fn new(stats_period_ms: u64, loss_window_count: usize, now_ms: u64) -> ConnectionStatsAggregator {
        ConnectionStatsAggregator {
            stats_period_ms,
            window_start_ms: now_ms,
            out_packets: 0,
            out_bytes: 0,
            in_packets: 0,
            in_bytes: 0,
            packets_delivered: 0,
            packets_lost: 0,
            smoothed_loss: RollingData::new(loss_window_count),
        }
    }

    /// one packet sent; `bytes` includes the transport overhead so rates reflect actual
    ///  link usage
    pub fn record_sent(&mut self, bytes: usize) {
        self.out_packets += 1;
        self.out_bytes += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.in_packets += 1;
        self.in_bytes += bytes as u64;
    }

    /// one of our sent packets was acknowledged
    pub fn record_ack(&mut self) {
        self.packets_delivered += 1;
    }

    /// one of our sent packets was conclusively lost
    pub fn record_packet_lost(&mut self) {
        self.packets_lost += 1;
    }

    /// Close the current window if the period has elapsed. Call this regularly; between
    ///  period boundaries it is a cheap no-op returning `None`.
    pub fn tick(&mut self, now_ms: u64) -> Option<ConnectionStatsSnapshot> {
        let window_ms = now_ms.saturating_sub(self.window_start_ms);
        if window_ms < self.stats_period_ms {
            return None;
        }

        let judged = self.packets_delivered + self.packets_lost;
        let window_loss = if judged > 0 {
            self.packets_lost as f64 / judged as f64 * 100.0
        }
        else {
            0.0
        };
        self.smoothed_loss.add_value(window_loss);

        let per_second = |count: u64| count as f64 * 1000.0 / window_ms as f64;
        let snapshot = ConnectionStatsSnapshot {
            window_ms,
            out_packets: self.out_packets,
            out_bytes: self.out_bytes,
            in_packets: self.in_packets,
            in_bytes: self.in_bytes,
            out_packets_per_second: per_second(self.out_packets),
            out_bytes_per_second: per_second(self.out_bytes),
            in_packets_per_second: per_second(self.in_packets),
            in_bytes_per_second: per_second(self.in_bytes),
            packets_delivered: self.packets_delivered,
            packets_lost: self.packets_lost,
            loss_percentage: self.smoothed_loss.mean(),
        };
        debug!(
            "stats window closed: {:.0} B/s out, {:.0} B/s in, {:.1}% loss",
            snapshot.out_bytes_per_second, snapshot.in_bytes_per_second, snapshot.loss_percentage
        );

        self.window_start_ms = now_ms;
        self.out_packets = 0;
        self.out_bytes = 0;
        self.in_packets = 0;
        self.in_bytes = 0;
        self.packets_delivered = 0;
        self.packets_lost = 0;

        Some(snapshot)
    }
}
