use std::fmt::{Display, Formatter};

use crate::bit_buffer::{BitReader, BitWriter};

/// A packet sequence number in a modulo-2^14 space.
///
/// Sequence numbers represent positions in an unbounded, monotonically increasing stream,
///  stored with 14 bits on the wire. Comparison and subtraction are wraparound-safe as long
///  as the true distance between any two compared numbers is less than half the sequence
///  space - the bounded history windows elsewhere in the protocol guarantee this.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const BITS: u32 = 14;
    pub const MODULO: u16 = 1 << Self::BITS;
    const MASK: u16 = Self::MODULO - 1;
    const HALF: i16 = (Self::MODULO / 2) as i16;

    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u16) -> SeqNum {
        SeqNum(value & Self::MASK)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        self.plus(1)
    }

    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1) & Self::MASK)
    }

    pub fn plus(&self, n: u16) -> SeqNum {
        SeqNum(self.0.wrapping_add(n) & Self::MASK)
    }

    /// signed distance `self - other`, correct for any pair whose true distance is in
    ///  `[-MODULO/2, MODULO/2)`
    pub fn diff(&self, other: SeqNum) -> i16 {
        let d = (self.0.wrapping_sub(other.0) & Self::MASK) as i16;
        if d >= Self::HALF {
            d - Self::MODULO as i16
        }
        else {
            d
        }
    }

    pub fn is_more_recent_than(&self, other: SeqNum) -> bool {
        self.diff(other) > 0
    }

    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_bits(self.0 as u32, Self::BITS);
    }

    pub fn read(reader: &mut BitReader) -> anyhow::Result<SeqNum> {
        Ok(SeqNum(reader.read_bits(Self::BITS)? as u16))
    }
}

/// A fixed-capacity bit history of delivery dispositions, most recent entry at index 0.
///
/// New entries are pushed at the front; old entries fall off the trailing edge once the
///  capacity of 256 is exceeded. The effective width that goes on the wire is configured
///  per connection and may be smaller than the capacity.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct SequenceHistory {
    words: [u64; Self::NUM_WORDS],
}

impl SequenceHistory {
    pub const MAX_BITS: usize = 256;
    const NUM_WORDS: usize = Self::MAX_BITS / 64;

    pub fn new() -> SequenceHistory {
        SequenceHistory::default()
    }

    /// push the disposition of the next-more-recent sequence number, shifting all previous
    ///  entries one position towards the trailing edge
    pub fn push(&mut self, delivered: bool) {
        let mut carry = delivered;
        for word in self.words.iter_mut() {
            let next_carry = (*word >> 63) & 1 == 1;
            *word = (*word << 1) | (carry as u64);
            carry = next_carry;
        }
    }

    /// disposition of the entry `index` positions behind the most recent one; entries
    ///  outside the capacity are reported as not delivered
    pub fn is_delivered(&self, index: usize) -> bool {
        if index >= Self::MAX_BITS {
            return false;
        }
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    pub fn write(&self, writer: &mut BitWriter, width: u16) {
        debug_assert!(width as usize <= Self::MAX_BITS);
        for index in 0..width as usize {
            writer.write_bit(self.is_delivered(index));
        }
    }

    pub fn read(reader: &mut BitReader, width: u16) -> anyhow::Result<SequenceHistory> {
        debug_assert!(width as usize <= Self::MAX_BITS);
        let mut result = SequenceHistory::new();
        for index in 0..width as usize {
            if reader.read_bit()? {
                result.words[index / 64] |= 1 << (index % 64);
            }
        }
        Ok(result)
    }
}
