use tracing::{debug, trace};

use crate::error::TransportError;
use crate::packet_header::PacketHeader;
use crate::sequence::{SeqNum, SequenceHistory};

/// What became known about one of our previously sent packets.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketDisposition {
    Delivered,
    Lost,
}

/// Result of processing an incoming packet header.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ReceiveOutcome {
    /// The header advanced our state. `events` holds every sent sequence number whose
    ///  disposition newly became known, in strictly increasing sequence order - the
    ///  channel record relies on exactly this ordering.
    Accepted {
        events: Vec<(SeqNum, PacketDisposition)>,
    },
    /// A stale or duplicated header; no state was changed. Replays are a normal
    ///  consequence of datagram duplication and reordering, not a fault.
    Replay,
}

/// Per-connection acknowledgment state machine.
///
/// Tracks both directions: which of the peer's packets we have seen (reported back to the
///  peer as the ack history in every outgoing header), and what the peer's headers tell
///  us about the packets we sent. A sent packet's disposition becomes known either
///  positively (its bit is set in the peer's history) or negatively (the peer's history
///  window advanced past it with the bit never set) - the latter bounds loss detection
///  latency to the history width without requiring explicit naks.
pub struct PacketNotify {
    ack_history_bits: u16,

    /// sequence number the next flushed packet will carry
    next_out_seq: SeqNum,
    /// highest of our sequence numbers whose disposition has been dispatched
    last_processed_ack: SeqNum,

    /// highest peer sequence number received so far
    in_seq: SeqNum,
    /// our delivery record of the peer's packets, most recent (`in_seq`) at index 0
    in_history: SequenceHistory,
}

impl PacketNotify {
    pub fn new(ack_history_bits: u16) -> PacketNotify {
        debug_assert!(ack_history_bits as usize <= SequenceHistory::MAX_BITS);
        PacketNotify {
            ack_history_bits,
            next_out_seq: SeqNum::ZERO,
            // the predecessor of the first real sequence number: "nothing processed yet"
            last_processed_ack: SeqNum::ZERO.prev(),
            in_seq: SeqNum::ZERO.prev(),
            in_history: SequenceHistory::new(),
        }
    }

    /// The sequence number the packet currently under construction will be stamped with.
    pub fn peek_next_outgoing(&self) -> SeqNum {
        self.next_out_seq
    }

    /// Called exactly once per flush: returns the sequence number for the outgoing packet
    ///  and advances the outgoing sequence.
    pub fn commit_and_increment_outgoing(&mut self) -> SeqNum {
        let seq = self.next_out_seq;
        self.next_out_seq = seq.next();
        seq
    }

    /// Fill the acknowledgment fields of an outgoing header with our view of the peer's
    ///  recent packets.
    pub fn write_header_fields(&self, header: &mut PacketHeader) {
        header.acked_seq = self.in_seq;
        header.ack_history = self.in_history.clone();
    }

    /// Process an incoming header: record the peer's packet in our ack history, and
    ///  determine the dispositions of our own packets from the peer's reported history.
    pub fn update(&mut self, header: &PacketHeader) -> Result<ReceiveOutcome, TransportError> {
        let seq_delta = header.seq.diff(self.in_seq);
        if seq_delta <= 0 {
            debug!(
                "incoming packet #{} is not more recent than #{} - stale or duplicated, ignoring",
                header.seq, self.in_seq
            );
            return Ok(ReceiveOutcome::Replay);
        }

        // the peer cannot have received packets we have not sent
        if header.acked_seq.diff(self.next_out_seq.prev()) > 0 {
            return Err(TransportError::MalformedHeader {
                reason: format!(
                    "peer acknowledged #{} but our highest sent sequence is #{}",
                    header.acked_seq,
                    self.next_out_seq.prev()
                ),
            });
        }
        let ack_delta = header.acked_seq.diff(self.last_processed_ack);
        if ack_delta < 0 {
            // the ack base is monotone with the packet sequence on a well-behaved peer,
            //  and stale packets were already filtered out above
            return Err(TransportError::MalformedHeader {
                reason: format!(
                    "ack base regressed from #{} to #{}",
                    self.last_processed_ack, header.acked_seq
                ),
            });
        }

        // record the peer's packet: every skipped sequence number is recorded as missing
        //  so the peer learns about the gap from our next header
        let gap = (seq_delta as usize - 1).min(SequenceHistory::MAX_BITS);
        for _ in 0..gap {
            self.in_history.push(false);
        }
        self.in_history.push(true);
        self.in_seq = header.seq;

        // dispatch newly known dispositions of our own packets, oldest first
        let mut events = Vec::with_capacity(ack_delta as usize);
        for i in 1..=ack_delta {
            let seq = self.last_processed_ack.plus(i as u16);
            let history_index = (ack_delta - i) as usize;
            let disposition = if history_index < self.ack_history_bits as usize
                && header.ack_history.is_delivered(history_index)
            {
                PacketDisposition::Delivered
            }
            else {
                // either the peer recorded the packet as missing, or its bit already fell
                //  off the history window - both are conclusive
                PacketDisposition::Lost
            };
            events.push((seq, disposition));
        }
        self.last_processed_ack = header.acked_seq;

        trace!(
            "processed header #{}: ack base #{}, {} new dispositions",
            header.seq,
            header.acked_seq,
            events.len()
        );
        Ok(ReceiveOutcome::Accepted { events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use PacketDisposition::*;

    fn header(seq: u16, acked: u16, delivered_indices: &[usize]) -> PacketHeader {
        let mut history = SequenceHistory::new();
        let max = delivered_indices.iter().copied().max().unwrap_or(0);
        for i in (0..=max).rev() {
            history.push(delivered_indices.contains(&i));
        }
        PacketHeader {
            seq: SeqNum::from_raw(seq),
            acked_seq: SeqNum::from_raw(acked),
            ack_history: history,
            jitter_clock_ms: None,
            frame_time_ms: None,
        }
    }

    fn sent(notify: &mut PacketNotify, count: u16) {
        for _ in 0..count {
            notify.commit_and_increment_outgoing();
        }
    }

    fn events(outcome: ReceiveOutcome) -> Vec<(u16, PacketDisposition)> {
        match outcome {
            ReceiveOutcome::Accepted { events } => {
                events.into_iter().map(|(s, d)| (s.to_raw(), d)).collect()
            }
            ReceiveOutcome::Replay => panic!("expected Accepted, got Replay"),
        }
    }

    #[test]
    fn test_commit_and_increment_is_sequential() {
        let mut notify = PacketNotify::new(32);
        assert_eq!(notify.peek_next_outgoing(), SeqNum::ZERO);
        assert_eq!(notify.commit_and_increment_outgoing(), SeqNum::from_raw(0));
        assert_eq!(notify.commit_and_increment_outgoing(), SeqNum::from_raw(1));
        assert_eq!(notify.peek_next_outgoing(), SeqNum::from_raw(2));
    }

    #[test]
    fn test_all_delivered_in_order() {
        let mut notify = PacketNotify::new(32);
        sent(&mut notify, 3);

        // peer received all of 0, 1, 2: base 2, history bits 0 (=2), 1 (=1), 2 (=0) set
        let outcome = notify.update(&header(0, 2, &[0, 1, 2])).unwrap();
        assert_eq!(
            events(outcome),
            vec![(0, Delivered), (1, Delivered), (2, Delivered)]
        );
    }

    #[test]
    fn test_nak_in_the_middle_scenario() {
        // the canonical scenario: 10 packets sent, peer acks 0-4 and 6-9, naks 5
        let mut notify = PacketNotify::new(32);
        sent(&mut notify, 10);

        let delivered: Vec<usize> = (0..10).filter(|&i| i != 4).collect(); // index 4 <=> seq 5
        let outcome = notify.update(&header(0, 9, &delivered)).unwrap();

        let expected: Vec<(u16, PacketDisposition)> = (0..10)
            .map(|s| (s, if s == 5 { Lost } else { Delivered }))
            .collect();
        assert_eq!(events(outcome), expected);

        // a replayed header produces no further events - seq 5 is reported exactly once
        assert_eq!(
            notify.update(&header(0, 9, &delivered)).unwrap(),
            ReceiveOutcome::Replay
        );
    }

    #[test]
    fn test_incremental_updates_report_each_seq_once() {
        let mut notify = PacketNotify::new(32);
        sent(&mut notify, 6);

        let outcome = notify.update(&header(0, 2, &[0, 1, 2])).unwrap();
        assert_eq!(events(outcome).len(), 3);

        // next header advances the base to 5 with 3 and 5 delivered, 4 missing
        let outcome = notify.update(&header(1, 5, &[0, 2])).unwrap();
        assert_eq!(events(outcome), vec![(3, Delivered), (4, Lost), (5, Delivered)]);
    }

    #[test]
    fn test_no_new_ack_info_yields_no_events() {
        let mut notify = PacketNotify::new(32);
        sent(&mut notify, 2);

        let outcome = notify.update(&header(0, 1, &[0, 1])).unwrap();
        assert_eq!(events(outcome).len(), 2);

        // newer packet, same ack base
        let outcome = notify.update(&header(1, 1, &[0, 1])).unwrap();
        assert_eq!(events(outcome), vec![]);
    }

    #[test]
    fn test_bit_fallen_off_history_window_is_lost() {
        let mut notify = PacketNotify::new(4);
        sent(&mut notify, 8);

        // base 7 with a 4-bit history covering seqs 4..=7; seqs 0..=3 are past the window
        let outcome = notify.update(&header(0, 7, &[0, 1, 2, 3])).unwrap();
        assert_eq!(
            events(outcome),
            vec![
                (0, Lost),
                (1, Lost),
                (2, Lost),
                (3, Lost),
                (4, Delivered),
                (5, Delivered),
                (6, Delivered),
                (7, Delivered),
            ]
        );
    }

    #[test]
    fn test_stale_packet_is_a_replay() {
        let mut notify = PacketNotify::new(32);
        sent(&mut notify, 1);

        assert!(matches!(
            notify.update(&header(5, 0, &[0])).unwrap(),
            ReceiveOutcome::Accepted { .. }
        ));
        assert_eq!(
            notify.update(&header(3, 0, &[0])).unwrap(),
            ReceiveOutcome::Replay
        );
        assert_eq!(
            notify.update(&header(5, 0, &[0])).unwrap(),
            ReceiveOutcome::Replay
        );
    }

    #[test]
    fn test_ack_of_unsent_sequence_is_malformed() {
        let mut notify = PacketNotify::new(32);
        sent(&mut notify, 2);

        let result = notify.update(&header(0, 7, &[0]));
        assert!(matches!(
            result,
            Err(TransportError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_ack_before_anything_sent_is_malformed() {
        let mut notify = PacketNotify::new(32);
        let result = notify.update(&header(0, 0, &[0]));
        assert!(matches!(
            result,
            Err(TransportError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_initial_header_without_acks_is_accepted() {
        let mut notify = PacketNotify::new(32);
        // a peer that has received nothing sends the initial ack base
        let initial_base = SeqNum::ZERO.prev().to_raw();
        let outcome = notify.update(&header(0, initial_base, &[])).unwrap();
        assert_eq!(events(outcome), vec![]);
    }

    #[test]
    fn test_incoming_gaps_are_recorded_as_missing() {
        let mut notify = PacketNotify::new(32);

        notify.update(&header(0, SeqNum::ZERO.prev().to_raw(), &[])).unwrap();
        notify.update(&header(3, SeqNum::ZERO.prev().to_raw(), &[])).unwrap();

        let mut out_header = PacketHeader {
            seq: SeqNum::ZERO,
            acked_seq: SeqNum::ZERO,
            ack_history: SequenceHistory::new(),
            jitter_clock_ms: None,
            frame_time_ms: None,
        };
        notify.write_header_fields(&mut out_header);

        assert_eq!(out_header.acked_seq, SeqNum::from_raw(3));
        assert!(out_header.ack_history.is_delivered(0)); // #3
        assert!(!out_header.ack_history.is_delivered(1)); // #2 missing
        assert!(!out_header.ack_history.is_delivered(2)); // #1 missing
        assert!(out_header.ack_history.is_delivered(3)); // #0
    }

    #[rstest]
    #[case::adjacent(1)]
    #[case::small_gap(5)]
    #[case::giant_gap(8000)]
    fn test_large_incoming_gap_does_not_panic(#[case] jump: u16) {
        let mut notify = PacketNotify::new(256);
        notify.update(&header(0, SeqNum::ZERO.prev().to_raw(), &[])).unwrap();
        notify
            .update(&header(jump, SeqNum::ZERO.prev().to_raw(), &[]))
            .unwrap();
        let mut out_header = header(0, 0, &[]);
        notify.write_header_fields(&mut out_header);
        assert_eq!(out_header.acked_seq, SeqNum::from_raw(jump));
    }

    #[test]
    fn test_wraparound_sequence_space() {
        let mut notify = PacketNotify::new(32);
        // pretend we are near the end of the sequence space
        notify.next_out_seq = SeqNum::from_raw(SeqNum::MODULO - 2);
        notify.last_processed_ack = SeqNum::from_raw(SeqNum::MODULO - 3);
        sent(&mut notify, 3); // sends 16382, 16383, 0

        let outcome = notify
            .update(&header(0, 0, &[0, 1, 2]))
            .unwrap();
        assert_eq!(
            events(outcome),
            vec![
                (SeqNum::MODULO - 2, Delivered),
                (SeqNum::MODULO - 1, Delivered),
                (0, Delivered),
            ]
        );
    }
}
