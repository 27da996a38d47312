//! Bit-level buffers for packet assembly and parsing.
//!
//! The packet header layout is bit-exact (see the crate documentation), and payload space
//!  is budgeted in bits rather than bytes, so the byte-oriented `bytes` traits are not
//!  sufficient on their own. These buffers write and read in MSB-first order within each
//!  byte; a partially filled trailing byte is padded with zero bits.

use anyhow::bail;
use bytes::Bytes;

/// An append-only bit buffer with support for truncating back to a previously remembered
///  position (the mechanism behind retroactive write merging in the packet builder).
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    len_bits: usize,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter::default()
    }

    pub fn num_bits(&self) -> usize {
        self.len_bits
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.len_bits = 0;
    }

    pub fn write_bit(&mut self, bit: bool) {
        let byte_index = self.len_bits / 8;
        if byte_index == self.buf.len() {
            self.buf.push(0);
        }
        if bit {
            self.buf[byte_index] |= 0x80 >> (self.len_bits % 8);
        }
        self.len_bits += 1;
    }

    /// write the lowest `count` bits of `value`, most significant of those first
    pub fn write_bits(&mut self, value: u32, count: u32) {
        debug_assert!(count <= 32);
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// append the first `count` bits of `bytes`, MSB-first within each byte
    pub fn write_slice_bits(&mut self, bytes: &[u8], count: usize) {
        debug_assert!(count <= bytes.len() * 8);
        for i in 0..count {
            let bit = (bytes[i / 8] >> (7 - (i % 8))) & 1 == 1;
            self.write_bit(bit);
        }
    }

    pub fn append(&mut self, other: &BitWriter) {
        self.write_slice_bits(&other.buf, other.len_bits);
    }

    /// discard everything written after bit position `len_bits`
    pub fn truncate(&mut self, len_bits: usize) {
        assert!(
            len_bits <= self.len_bits,
            "truncate past the end of the buffer: {} > {}",
            len_bits,
            self.len_bits
        );
        self.buf.truncate(len_bits.div_ceil(8));
        if len_bits % 8 != 0 {
            // zero out the now-stale bits of the partial trailing byte so future writes
            //  OR into a clean slate
            let keep_mask = !(0xffu8 >> (len_bits % 8));
            if let Some(last) = self.buf.last_mut() {
                *last &= keep_mask;
            }
        }
        self.len_bits = len_bits;
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// A bit-level cursor over a received packet buffer.
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos_bits: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> BitReader<'a> {
        BitReader { buf, pos_bits: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.buf.len() * 8 - self.pos_bits
    }

    pub fn read_bit(&mut self) -> anyhow::Result<bool> {
        if self.remaining_bits() == 0 {
            bail!("bit buffer exhausted at position {}", self.pos_bits);
        }
        let bit = (self.buf[self.pos_bits / 8] >> (7 - (self.pos_bits % 8))) & 1 == 1;
        self.pos_bits += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, count: u32) -> anyhow::Result<u32> {
        debug_assert!(count <= 32);
        if (self.remaining_bits() as u64) < count as u64 {
            bail!(
                "bit buffer exhausted: {} bits requested, {} remaining",
                count,
                self.remaining_bits()
            );
        }
        let mut result = 0u32;
        for _ in 0..count {
            result = (result << 1) | (self.read_bit()? as u32);
        }
        Ok(result)
    }

    /// copy all remaining bits into a fresh byte-aligned buffer (zero-padded at the tail)
    pub fn remaining_to_bytes(&mut self) -> Bytes {
        let mut writer = BitWriter::new();
        while self.remaining_bits() > 0 {
            let bit = self
                .read_bit()
                .expect("remaining_bits was checked to be non-zero");
            writer.write_bit(bit);
        }
        writer.into_bytes()
    }
}
