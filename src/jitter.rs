use tracing::{debug, trace};

use crate::packet_header::PacketHeader;

/// Delay-variation tracking from the jitter clock carried in packet headers.
///
/// Each incoming packet carries the sender's wall clock at send time, reduced to
///  milliseconds modulo 1024. Comparing the spacing of two consecutive sends with the
///  spacing of their arrivals gives one jitter sample without any clock synchronization
///  between the peers: constant network delay cancels out, only its variation remains.
///  Samples are smoothed exponentially; after a traffic stall longer than the configured
///  gap the send-clock delta becomes ambiguous (the 10-bit clock may have wrapped any
///  number of times), so the average restarts from zero instead of smoothing across it.
pub struct JitterTracker {
    smoothing_factor: f64,
    reset_gap_ms: u64,
    avg_jitter_ms: f64,
    prev: Option<PrevPacket>,
}

struct PrevPacket {
    sent_clock_ms: u16,
    recv_ms: u64,
}

impl JitterTracker {
    pub fn new(smoothing_factor: f64, reset_gap_ms: u64) -> JitterTracker {
        debug_assert!(smoothing_factor > 0.0 && smoothing_factor <= 1.0);
        debug_assert!(reset_gap_ms < PacketHeader::JITTER_CLOCK_MODULO_MS);
        JitterTracker {
            smoothing_factor,
            reset_gap_ms,
            avg_jitter_ms: 0.0,
            prev: None,
        }
    }

    /// feed one received packet's send clock and local receive time, returning the
    ///  updated smoothed jitter
    pub fn process(&mut self, sent_clock_ms: u16, local_recv_ms: u64) -> f64 {
        debug_assert!((sent_clock_ms as u64) < PacketHeader::JITTER_CLOCK_MODULO_MS);

        match &self.prev {
            Some(prev) if local_recv_ms.saturating_sub(prev.recv_ms) <= self.reset_gap_ms => {
                let send_delta = Self::clock_delta(prev.sent_clock_ms, sent_clock_ms);
                let recv_delta = (local_recv_ms - prev.recv_ms) as i64;
                let sample = (recv_delta - send_delta).abs() as f64;

                self.avg_jitter_ms += self.smoothing_factor * (sample - self.avg_jitter_ms);
                trace!("jitter sample {} ms, smoothed {:.2} ms", sample, self.avg_jitter_ms);
            }
            Some(prev) => {
                debug!(
                    "{} ms without packets, resetting jitter tracking",
                    local_recv_ms.saturating_sub(prev.recv_ms)
                );
                self.avg_jitter_ms = 0.0;
            }
            None => {
                // first packet: no spacing to compare yet
                self.avg_jitter_ms = 0.0;
            }
        }

        self.prev = Some(PrevPacket {
            sent_clock_ms,
            recv_ms: local_recv_ms,
        });
        self.avg_jitter_ms
    }

    pub fn avg_jitter_ms(&self) -> f64 {
        self.avg_jitter_ms
    }

    /// signed difference of two 10-bit clock readings, correct as long as the true
    ///  spacing is below half the clock period (ensured by the reset gap check)
    fn clock_delta(prev: u16, cur: u16) -> i64 {
        const MODULO: i64 = PacketHeader::JITTER_CLOCK_MODULO_MS as i64;
        let d = (cur.wrapping_sub(prev) as i64) & (MODULO - 1);
        if d >= MODULO / 2 {
            d - MODULO
        }
        else {
            d
        }
    }
}
