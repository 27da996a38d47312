use anyhow::Context;

use crate::bit_buffer::{BitReader, BitWriter};
use crate::sequence::{SeqNum, SequenceHistory};

/// The header written at the start of every outgoing packet and parsed from every
///  incoming one. See the crate documentation for the bit-exact layout; writer and
///  reader must agree on the configured ack history width, any change to a field width
///  is a wire-breaking change.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    /// this packet's own outgoing sequence number
    pub seq: SeqNum,
    /// the highest peer sequence number the sender has received, base of the ack history
    pub acked_seq: SeqNum,
    /// ack/nak dispositions for the packets preceding `acked_seq`, most recent first
    pub ack_history: SequenceHistory,
    /// the sender's wall clock at send time, millis modulo 1024, for jitter measurement
    pub jitter_clock_ms: Option<u16>,
    /// the sender's last measured frame processing time in millis, clamped to one byte,
    ///  so the receiver can exclude it from round-trip measurements
    pub frame_time_ms: Option<u8>,
}

impl PacketHeader {
    pub const JITTER_CLOCK_BITS: u32 = 10;
    pub const JITTER_CLOCK_MODULO_MS: u64 = 1 << Self::JITTER_CLOCK_BITS;
    const FRAME_TIME_BITS: u32 = 8;

    /// worst-case header size for a given history width, used for packet bit budgeting
    pub fn max_serialized_bits(ack_history_bits: u16) -> usize {
        2 * SeqNum::BITS as usize
            + ack_history_bits as usize
            + 1
            + Self::JITTER_CLOCK_BITS as usize
            + 1
            + Self::FRAME_TIME_BITS as usize
    }

    pub fn ser(&self, writer: &mut BitWriter, ack_history_bits: u16) {
        self.seq.write(writer);
        self.acked_seq.write(writer);
        self.ack_history.write(writer, ack_history_bits);

        writer.write_bit(self.jitter_clock_ms.is_some());
        if let Some(clock) = self.jitter_clock_ms {
            debug_assert!((clock as u64) < Self::JITTER_CLOCK_MODULO_MS);
            writer.write_bits(clock as u32, Self::JITTER_CLOCK_BITS);
        }

        writer.write_bit(self.frame_time_ms.is_some());
        if let Some(frame_time) = self.frame_time_ms {
            writer.write_bits(frame_time as u32, Self::FRAME_TIME_BITS);
        }
    }

    pub fn deser(reader: &mut BitReader, ack_history_bits: u16) -> anyhow::Result<PacketHeader> {
        let seq = SeqNum::read(reader).context("packet sequence number")?;
        let acked_seq = SeqNum::read(reader).context("ack base sequence number")?;
        let ack_history = SequenceHistory::read(reader, ack_history_bits).context("ack history")?;

        let jitter_clock_ms = if reader.read_bit().context("jitter clock flag")? {
            Some(reader.read_bits(Self::JITTER_CLOCK_BITS).context("jitter clock")? as u16)
        }
        else {
            None
        };

        let frame_time_ms = if reader.read_bit().context("frame time flag")? {
            Some(reader.read_bits(Self::FRAME_TIME_BITS).context("frame time")? as u8)
        }
        else {
            None
        };

        Ok(PacketHeader {
            seq,
            acked_seq,
            ack_history,
            jitter_clock_ms,
            frame_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn history_from_pattern(pattern: &[bool]) -> SequenceHistory {
        let mut history = SequenceHistory::new();
        for &delivered in pattern.iter().rev() {
            history.push(delivered);
        }
        history
    }

    #[rstest]
    #[case::plain(7, 3, vec![true, false, true], None, None)]
    #[case::with_clock(100, 99, vec![true; 32], Some(1023), None)]
    #[case::with_frame_time(0, 16383, vec![false; 32], None, Some(255))]
    #[case::everything(12345, 12344, vec![true, true, false, true], Some(512), Some(16))]
    fn test_round_trip(
        #[case] seq: u16,
        #[case] acked: u16,
        #[case] history_pattern: Vec<bool>,
        #[case] jitter_clock_ms: Option<u16>,
        #[case] frame_time_ms: Option<u8>,
    ) {
        let ack_history_bits = 32u16;
        let original = PacketHeader {
            seq: SeqNum::from_raw(seq),
            acked_seq: SeqNum::from_raw(acked),
            ack_history: history_from_pattern(&history_pattern),
            jitter_clock_ms,
            frame_time_ms,
        };

        let mut writer = BitWriter::new();
        original.ser(&mut writer, ack_history_bits);
        assert!(writer.num_bits() <= PacketHeader::max_serialized_bits(ack_history_bits));
        let buf = writer.into_bytes();

        let mut reader = BitReader::new(&buf);
        let deserialized = PacketHeader::deser(&mut reader, ack_history_bits).unwrap();

        assert_eq!(deserialized.seq, original.seq);
        assert_eq!(deserialized.acked_seq, original.acked_seq);
        assert_eq!(deserialized.jitter_clock_ms, original.jitter_clock_ms);
        assert_eq!(deserialized.frame_time_ms, original.frame_time_ms);
        for i in 0..ack_history_bits as usize {
            assert_eq!(
                deserialized.ack_history.is_delivered(i),
                original.ack_history.is_delivered(i),
                "history index {}",
                i
            );
        }
    }

    #[test]
    fn test_deser_of_truncated_buffer_fails() {
        let header = PacketHeader {
            seq: SeqNum::from_raw(1),
            acked_seq: SeqNum::ZERO,
            ack_history: SequenceHistory::new(),
            jitter_clock_ms: Some(100),
            frame_time_ms: None,
        };
        let mut writer = BitWriter::new();
        header.ser(&mut writer, 256);
        let buf = writer.into_bytes();

        let mut reader = BitReader::new(&buf[..2]);
        assert!(PacketHeader::deser(&mut reader, 256).is_err());
    }

    #[test]
    fn test_max_serialized_bits_is_an_upper_bound() {
        let header = PacketHeader {
            seq: SeqNum::from_raw(16383),
            acked_seq: SeqNum::from_raw(16383),
            ack_history: history_from_pattern(&[true; 64]),
            jitter_clock_ms: Some(1023),
            frame_time_ms: Some(255),
        };
        let mut writer = BitWriter::new();
        header.ser(&mut writer, 64);
        assert_eq!(writer.num_bits(), PacketHeader::max_serialized_bits(64));
    }
}
