use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use rustc_hash::FxHashSet;

use crate::sequence::SeqNum;

/// Identifier of a logical channel multiplexed over one connection. Ten bits on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub struct ChannelId(u16);

impl ChannelId {
    pub const BITS: u32 = 10;
    pub const MAX: u16 = (1 << Self::BITS) - 1;

    pub fn from_raw(value: u16) -> ChannelId {
        debug_assert!(value <= Self::MAX);
        ChannelId(value & Self::MAX)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PacketEntry {
    seq: SeqNum,
    channels: Vec<ChannelId>,
}

/// FIFO attribution of sent packets to the channels with reliable data in them.
///
/// While a packet is being built, channels writing reliable data into it register here;
///  when the packet is flushed its channel set is committed under the packet's sequence
///  number. Acknowledgment events arrive in increasing sequence order (the packet notify
///  guarantees this), so consuming from the front of the queue is sufficient - there is
///  never a need to search.
pub struct ChannelRecord {
    /// channels registered for the packet currently under construction, deduplicated
    current: Vec<ChannelId>,
    current_set: FxHashSet<ChannelId>,
    committed: VecDeque<PacketEntry>,
}

impl ChannelRecord {
    pub fn new() -> ChannelRecord {
        ChannelRecord {
            current: Vec::new(),
            current_set: FxHashSet::default(),
            committed: VecDeque::new(),
        }
    }

    /// register reliable data of `channel` in the packet currently under construction;
    ///  idempotent per packet
    pub fn register(&mut self, channel: ChannelId) {
        if self.current_set.insert(channel) {
            self.current.push(channel);
        }
    }

    /// seal the packet under construction: its registered channels (possibly none) are
    ///  stored under `seq` for later consumption
    pub fn commit_packet(&mut self, seq: SeqNum) {
        if let Some(last) = self.committed.back() {
            debug_assert!(seq.is_more_recent_than(last.seq));
        }
        self.committed.push_back(PacketEntry {
            seq,
            channels: std::mem::take(&mut self.current),
        });
        self.current_set.clear();
    }

    /// Hand out the channels recorded for `seq`, calling `f` once per channel in
    ///  registration order. Sequence numbers must be consumed in exactly the order they
    ///  were committed; skipping or reordering is a bug in the caller.
    pub fn consume(&mut self, seq: SeqNum, mut f: impl FnMut(ChannelId)) {
        let entry = self
            .committed
            .pop_front()
            .unwrap_or_else(|| panic!("no record for packet #{}", seq));
        assert_eq!(
            entry.seq, seq,
            "packet records must be consumed in commit order: expected #{}, got #{}",
            entry.seq, seq
        );
        for channel in entry.channels {
            f(channel);
        }
    }

    /// number of flushed packets whose disposition is not yet known
    pub fn num_outstanding(&self) -> usize {
        self.committed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(id: u16) -> ChannelId {
        ChannelId::from_raw(id)
    }

    fn consumed(record: &mut ChannelRecord, seq: u16) -> Vec<u16> {
        let mut result = Vec::new();
        record.consume(SeqNum::from_raw(seq), |c| result.push(c.to_raw()));
        result
    }

    #[test]
    fn test_register_and_consume_in_order() {
        let mut record = ChannelRecord::new();

        record.register(ch(3));
        record.register(ch(1));
        record.commit_packet(SeqNum::from_raw(0));

        record.register(ch(2));
        record.commit_packet(SeqNum::from_raw(1));

        assert_eq!(record.num_outstanding(), 2);
        assert_eq!(consumed(&mut record, 0), vec![3, 1]);
        assert_eq!(consumed(&mut record, 1), vec![2]);
        assert_eq!(record.num_outstanding(), 0);
    }

    #[test]
    fn test_register_is_idempotent_per_packet() {
        let mut record = ChannelRecord::new();

        record.register(ch(7));
        record.register(ch(7));
        record.register(ch(4));
        record.register(ch(7));
        record.commit_packet(SeqNum::from_raw(0));

        assert_eq!(consumed(&mut record, 0), vec![7, 4]);
    }

    #[test]
    fn test_registration_resets_between_packets() {
        let mut record = ChannelRecord::new();

        record.register(ch(7));
        record.commit_packet(SeqNum::from_raw(0));

        // the same channel registers again for the next packet
        record.register(ch(7));
        record.commit_packet(SeqNum::from_raw(1));

        assert_eq!(consumed(&mut record, 0), vec![7]);
        assert_eq!(consumed(&mut record, 1), vec![7]);
    }

    #[test]
    fn test_packet_without_reliable_data_has_empty_record() {
        let mut record = ChannelRecord::new();

        record.commit_packet(SeqNum::from_raw(0));
        record.register(ch(1));
        record.commit_packet(SeqNum::from_raw(1));

        assert_eq!(consumed(&mut record, 0), vec![]);
        assert_eq!(consumed(&mut record, 1), vec![1]);
    }

    #[test]
    #[should_panic(expected = "consumed in commit order")]
    fn test_out_of_order_consume_panics() {
        let mut record = ChannelRecord::new();
        record.commit_packet(SeqNum::from_raw(0));
        record.commit_packet(SeqNum::from_raw(1));

        record.consume(SeqNum::from_raw(1), |_| {});
    }

    #[test]
    #[should_panic(expected = "no record for packet")]
    fn test_consume_of_unknown_packet_panics() {
        let mut record = ChannelRecord::new();
        record.consume(SeqNum::from_raw(5), |_| {});
    }
}
