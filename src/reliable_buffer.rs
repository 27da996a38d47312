use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::channel_record::ChannelId;
use crate::error::TransportError;
use crate::sequence::SeqNum;

struct OutstandingMessage {
    rel_seq: SeqNum,
    payload: Bytes,
    /// the packet currently carrying this message, `None` while it awaits (re)framing
    packet_seq: Option<SeqNum>,
}

/// Per-channel store of reliable messages that are not yet known to be delivered.
///
/// Every reliable message gets a sequence number from this channel's own 14-bit space and
///  keeps it across retransmissions, so the receiving side can deduplicate and order
///  regardless of which packet eventually carried the message through. The buffer is
///  bounded: a full buffer means the peer is not acknowledging fast enough, and the
///  resulting backpressure is the mechanism that keeps a connection from accumulating
///  unbounded state.
pub struct ReliableBuffer {
    channel: ChannelId,
    capacity: usize,
    next_rel_seq: SeqNum,
    messages: VecDeque<OutstandingMessage>,
}

impl ReliableBuffer {
    pub fn new(channel: ChannelId, capacity: usize) -> ReliableBuffer {
        ReliableBuffer {
            channel,
            capacity,
            next_rel_seq: SeqNum::ZERO,
            messages: VecDeque::new(),
        }
    }

    /// Accept a message for reliable delivery, assigning its sequence number. Fails with
    ///  backpressure when the buffer is at capacity; the message is not stored in that
    ///  case and the caller may retry after acks have freed up room.
    pub fn enqueue(&mut self, payload: Bytes) -> Result<SeqNum, TransportError> {
        if self.messages.len() >= self.capacity {
            debug!(
                "reliable buffer for channel {} is at capacity {}",
                self.channel, self.capacity
            );
            return Err(TransportError::ReliableBufferFull {
                channel: self.channel,
            });
        }
        let rel_seq = self.next_rel_seq;
        self.next_rel_seq = rel_seq.next();
        self.messages.push_back(OutstandingMessage {
            rel_seq,
            payload,
            packet_seq: None,
        });
        Ok(rel_seq)
    }

    /// record that `rel_seq` was framed into the packet with sequence `packet_seq`
    pub fn assign_packet(&mut self, rel_seq: SeqNum, packet_seq: SeqNum) {
        let msg = self.message_mut(rel_seq);
        msg.packet_seq = Some(packet_seq);
    }

    /// the reliable sequence numbers currently riding in packet `packet_seq`, oldest first
    pub fn sequences_in_packet(&self, packet_seq: SeqNum) -> Vec<SeqNum> {
        self.messages
            .iter()
            .filter(|m| m.packet_seq == Some(packet_seq))
            .map(|m| m.rel_seq)
            .collect()
    }

    /// the carrying packet was acknowledged: the message is done, release it
    pub fn on_delivered(&mut self, rel_seq: SeqNum) {
        let index = self.index_of(rel_seq);
        self.messages.remove(index);
        trace!(
            "reliable message {}:{} delivered, {} outstanding",
            self.channel,
            rel_seq,
            self.messages.len()
        );
    }

    /// The carrying packet was lost: return the original bytes for immediate re-framing.
    ///  The message keeps its sequence number and stays in the buffer until a packet that
    ///  carries it is eventually acknowledged.
    pub fn on_lost(&mut self, rel_seq: SeqNum) -> Bytes {
        let channel = self.channel;
        let msg = self.message_mut(rel_seq);
        msg.packet_seq = None;
        debug!("reliable message {}:{} lost, scheduling retransmission", channel, rel_seq);
        msg.payload.clone()
    }

    pub fn num_outstanding(&self) -> usize {
        self.messages.len()
    }

    fn index_of(&self, rel_seq: SeqNum) -> usize {
        // linear scan: released messages leave gaps, so offset arithmetic is not enough,
        //  and buffers are small
        self.messages
            .iter()
            .position(|m| m.rel_seq == rel_seq)
            .unwrap_or_else(|| panic!("no outstanding message {}:{}", self.channel, rel_seq))
    }

    fn message_mut(&mut self, rel_seq: SeqNum) -> &mut OutstandingMessage {
        let index = self.index_of(rel_seq);
        &mut self.messages[index]
    }
}
