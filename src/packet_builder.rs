use bytes::Bytes;

use crate::bit_buffer::BitWriter;
use crate::packet_header::PacketHeader;

/// Assembles the payload of one outgoing packet within a hard bit budget.
///
/// The budget is the packet size minus the worst-case header and the reserved trailer
///  bits, so a finalized packet can never exceed the configured packet size no matter
///  what the header ends up containing. Writes are all-or-nothing: a write that does not
///  fit refuses without mutating the buffer, and the caller decides whether to flush and
///  retry or to give up.
///
/// Header fields like the ack history keep changing while a packet is being filled, so
///  the header is kept out of the payload buffer entirely and only prepended at finalize
///  time. This avoids patching header bits in place after the fact.
pub struct PacketBuilder {
    max_payload_bits: usize,
    payload: BitWriter,
    /// bit position where the most recent write started, while it is still mergeable
    last_write_start: Option<usize>,
}

impl PacketBuilder {
    pub fn new(max_payload_bits: usize) -> PacketBuilder {
        PacketBuilder {
            max_payload_bits,
            payload: BitWriter::new(),
            last_write_start: None,
        }
    }

    pub fn num_payload_bits(&self) -> usize {
        self.payload.num_bits()
    }

    pub fn free_bits(&self) -> usize {
        self.max_payload_bits - self.payload.num_bits()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.num_bits() == 0
    }

    /// Append the first `count` bits of `bytes` as a new write. Returns false without
    ///  touching the buffer if the write does not fit into the remaining budget.
    pub fn write_bits(&mut self, bytes: &[u8], count: usize) -> bool {
        if count > self.free_bits() {
            return false;
        }
        self.last_write_start = Some(self.payload.num_bits());
        self.payload.write_slice_bits(bytes, count);
        true
    }

    /// Replace the most recent write with `count` bits of `bytes` (the caller has already
    ///  merged the old and new content). Returns false without mutating if there is no
    ///  write to replace or the replacement does not fit.
    pub fn try_merge_with_last_write(&mut self, bytes: &[u8], count: usize) -> bool {
        let Some(start) = self.last_write_start else {
            return false;
        };
        if start + count > self.max_payload_bits {
            return false;
        }
        self.payload.truncate(start);
        self.payload.write_slice_bits(bytes, count);
        true
    }

    /// Prepend the finalized header and hand out the complete packet buffer, resetting
    ///  the builder for the next packet.
    pub fn finalize(&mut self, header: &PacketHeader, ack_history_bits: u16) -> Bytes {
        let mut packet = BitWriter::new();
        header.ser(&mut packet, ack_history_bits);
        assert!(
            packet.num_bits() <= PacketHeader::max_serialized_bits(ack_history_bits),
            "header exceeded its size bound"
        );
        packet.append(&self.payload);

        self.payload.clear();
        self.last_write_start = None;
        packet.into_bytes()
    }
}
