use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::bit_buffer::{BitReader, BitWriter};
use crate::channel_record::{ChannelId, ChannelRecord};
use crate::config::ReliabilityConfig;
use crate::error::TransportError;
use crate::jitter::JitterTracker;
use crate::packet_builder::PacketBuilder;
use crate::packet_header::PacketHeader;
use crate::packet_notify::{PacketDisposition, PacketNotify, ReceiveOutcome};
use crate::reliable_buffer::ReliableBuffer;
use crate::send_pipeline::SendPipeline;
use crate::sequence::SeqNum;
use crate::stats::{ConnectionStatsAggregator, ConnectionStatsSnapshot};

/// Callbacks through which a connection reports what happened to reliable messages and
///  hands received packet payloads to the message dispatch layer.
#[cfg_attr(test, automock)]
pub trait ConnectionListener: Send + Sync + 'static {
    /// a reliable message is known to have reached the peer
    fn on_delivered(&self, channel: ChannelId, rel_seq: SeqNum);

    /// A reliable message's carrying packet was lost. Purely informational: the
    ///  connection has already scheduled the retransmission.
    fn on_lost(&self, channel: ChannelId, rel_seq: SeqNum);

    /// the message-framing payload of an accepted incoming packet, for dispatch
    fn on_packet_payload(&self, payload: Bytes);
}

/// width of the per-message length field
const MSG_LEN_BITS: u32 = 13;

/// What the length field can express - an upper bound from the wire format alone. The
///  effective cap for a connection is usually tighter, because a message must also fit a
///  single packet: pre-check against [`Connection::max_message_bytes`], not this.
pub const MAX_MESSAGE_BYTES: usize = (1 << MSG_LEN_BITS) - 1;

/// bits a reliable message frame occupies in addition to its payload
const RELIABLE_FRAME_OVERHEAD_BITS: usize = 1 + ChannelId::BITS as usize + SeqNum::BITS as usize + MSG_LEN_BITS as usize;
const UNRELIABLE_FRAME_OVERHEAD_BITS: usize = 1 + ChannelId::BITS as usize + MSG_LEN_BITS as usize;

/// One end of a reliability-layer connection to a single peer.
///
/// This is the single-writer orchestrator tying the pieces together: sequence numbering
///  and ack bookkeeping, per-channel reliable buffers, packet framing within the bit
///  budget, and the jitter/stats instrumentation. All methods take explicit `now_ms`
///  timestamps (milliseconds on any monotonic process-local clock) rather than reading a
///  clock themselves, which keeps the whole state machine deterministic under test.
///
/// Sending is two-phase: `send_reliable` / `send_unreliable` frame messages into the
///  packet under construction (flushing automatically when it runs full), and `flush`
///  seals and transmits the packet. A flush with nothing framed still sends a header-only
///  packet, which is how acks keep flowing on an otherwise idle connection.
pub struct Connection {
    config: Arc<ReliabilityConfig>,
    send_pipeline: SendPipeline,
    listener: Arc<dyn ConnectionListener>,

    notify: PacketNotify,
    channel_record: ChannelRecord,
    reliable_buffers: FxHashMap<ChannelId, ReliableBuffer>,
    builder: PacketBuilder,
    jitter: JitterTracker,
    stats: ConnectionStatsAggregator,

    /// last unreliable write in the packet under construction, kept for merging
    mergeable: Option<(ChannelId, Bytes)>,
    /// our own frame processing time, stamped into outgoing headers when set
    frame_time_ms: Option<u8>,
    /// the peer's most recently reported frame processing time
    peer_frame_time_ms: Option<u8>,
}

impl Connection {
    pub fn new(
        config: Arc<ReliabilityConfig>,
        send_pipeline: SendPipeline,
        listener: Arc<dyn ConnectionListener>,
        now_ms: u64,
    ) -> Connection {
        Connection {
            notify: PacketNotify::new(config.ack_history_bits),
            channel_record: ChannelRecord::new(),
            reliable_buffers: FxHashMap::default(),
            builder: PacketBuilder::new(config.max_payload_bits()),
            jitter: JitterTracker::new(config.jitter_smoothing_factor, config.jitter_reset_gap_ms),
            stats: ConnectionStatsAggregator::new(config.stats_period_ms, config.loss_window_count, now_ms),
            mergeable: None,
            frame_time_ms: None,
            peer_frame_time_ms: None,
            config,
            send_pipeline,
            listener,
        }
    }

    /// Frame a message for guaranteed, at-least-once delivery on `channel`. Returns the
    ///  message's reliable sequence number, or backpressure if too many messages on this
    ///  channel are still unacknowledged.
    pub async fn send_reliable(
        &mut self,
        channel: ChannelId,
        payload: Bytes,
        now_ms: u64,
    ) -> Result<SeqNum, TransportError> {
        self.check_message_size(&payload)?;

        let capacity = self.config.reliable_buffer_capacity;
        let rel_seq = self
            .reliable_buffers
            .entry(channel)
            .or_insert_with(|| ReliableBuffer::new(channel, capacity))
            .enqueue(payload.clone())?;

        self.write_message(channel, Some(rel_seq), &payload, now_ms).await;
        trace!("framed reliable message {}:{} ({} bytes)", channel, rel_seq, payload.len());
        Ok(rel_seq)
    }

    /// Frame a fire-and-forget message on `channel`. When merging is enabled and the
    ///  previous write into this packet was an unreliable message on the same channel,
    ///  the two are collapsed into a single frame to save the framing overhead.
    pub async fn send_unreliable(
        &mut self,
        channel: ChannelId,
        payload: Bytes,
        now_ms: u64,
    ) -> Result<(), TransportError> {
        self.check_message_size(&payload)?;

        if self.config.allow_merge {
            if let Some((merge_channel, prev)) = &self.mergeable {
                if *merge_channel == channel && prev.len() + payload.len() <= self.max_message_bytes() {
                    let mut merged = BytesMut::with_capacity(prev.len() + payload.len());
                    merged.put_slice(prev);
                    merged.put_slice(&payload);
                    let merged = merged.freeze();

                    let frame = Self::frame_message(channel, None, &merged);
                    if self.builder.try_merge_with_last_write(frame.as_slice(), frame.num_bits()) {
                        trace!("merged unreliable write on channel {} ({} bytes total)", channel, merged.len());
                        self.mergeable = Some((channel, merged));
                        return Ok(());
                    }
                }
            }
        }

        self.write_message(channel, None, &payload, now_ms).await;
        self.mergeable = Some((channel, payload));
        Ok(())
    }

    /// The largest message this connection accepts, determined by the packet size budget
    ///  and the framing overhead. Larger payloads must be split by the caller; this layer
    ///  does not chunk.
    pub fn max_message_bytes(&self) -> usize {
        ((self.config.max_payload_bits() - RELIABLE_FRAME_OVERHEAD_BITS) / 8).min(MAX_MESSAGE_BYTES)
    }

    fn check_message_size(&self, payload: &Bytes) -> Result<(), TransportError> {
        let max_bytes = self.max_message_bytes();
        if payload.len() > max_bytes {
            return Err(TransportError::MessageTooLarge {
                size_bytes: payload.len(),
                max_bytes,
            });
        }
        Ok(())
    }

    /// Seal the packet under construction and transmit it. Always sends, even with no
    ///  messages framed: the header alone carries the ack state the peer needs.
    pub async fn flush(&mut self, now_ms: u64) {
        let seq = self.notify.commit_and_increment_outgoing();
        self.channel_record.commit_packet(seq);
        self.mergeable = None;

        let mut header = PacketHeader {
            seq,
            acked_seq: SeqNum::ZERO,
            ack_history: Default::default(),
            jitter_clock_ms: Some((now_ms % PacketHeader::JITTER_CLOCK_MODULO_MS) as u16),
            frame_time_ms: self.frame_time_ms,
        };
        self.notify.write_header_fields(&mut header);

        let packet = self.builder.finalize(&header, self.config.ack_history_bits);
        trace!("flushing packet #{} ({} bytes)", seq, packet.len());
        self.send_pipeline.send_packet(&packet).await;
        self.stats.record_sent(packet.len() + self.config.transport_overhead_bytes);
    }

    /// Process one received datagram.
    ///
    /// An `Err` means the peer sent something structurally invalid and the caller should
    ///  close the connection; everything else (stale packets, duplicates) is absorbed
    ///  here. Retransmissions of reliable messages whose packets turn out lost are framed
    ///  immediately, into the packet under construction.
    pub async fn on_datagram(&mut self, data: &[u8], now_ms: u64) -> Result<(), TransportError> {
        let mut reader = BitReader::new(data);
        let header = PacketHeader::deser(&mut reader, self.config.ack_history_bits).map_err(|e| {
            warn!("undecodable packet header from {:?}: {:#}", self.send_pipeline.peer_addr(), e);
            TransportError::MalformedHeader {
                reason: format!("{:#}", e),
            }
        })?;
        self.stats.record_received(data.len() + self.config.transport_overhead_bytes);

        let events = match self.notify.update(&header)? {
            ReceiveOutcome::Accepted { events } => events,
            ReceiveOutcome::Replay => return Ok(()),
        };

        for (seq, disposition) in events {
            let mut channels = Vec::new();
            self.channel_record.consume(seq, |channel| channels.push(channel));

            match disposition {
                PacketDisposition::Delivered => {
                    self.stats.record_ack();
                    for channel in channels {
                        self.release_delivered(channel, seq);
                    }
                }
                PacketDisposition::Lost => {
                    self.stats.record_packet_lost();
                    for channel in channels {
                        self.retransmit_lost(channel, seq, now_ms).await;
                    }
                }
            }
        }

        if let Some(sent_clock) = header.jitter_clock_ms {
            self.jitter.process(sent_clock, now_ms);
        }
        if header.frame_time_ms.is_some() {
            self.peer_frame_time_ms = header.frame_time_ms;
        }

        // anything left beyond sub-byte padding is message payload for the dispatch layer
        if reader.remaining_bits() >= 8 {
            self.listener.on_packet_payload(reader.remaining_to_bytes());
        }
        Ok(())
    }

    /// close the stats window if due; call regularly, e.g. from the connection's tick
    pub fn poll_stats(&mut self, now_ms: u64) -> Option<ConnectionStatsSnapshot> {
        self.stats.tick(now_ms)
    }

    pub fn avg_jitter_ms(&self) -> f64 {
        self.jitter.avg_jitter_ms()
    }

    /// set our own frame processing time, carried in outgoing headers until changed
    pub fn set_frame_time_ms(&mut self, frame_time_ms: Option<u8>) {
        self.frame_time_ms = frame_time_ms;
    }

    pub fn peer_frame_time_ms(&self) -> Option<u8> {
        self.peer_frame_time_ms
    }

    pub fn num_outstanding_reliable(&self, channel: ChannelId) -> usize {
        self.reliable_buffers
            .get(&channel)
            .map(|b| b.num_outstanding())
            .unwrap_or(0)
    }

    fn release_delivered(&mut self, channel: ChannelId, packet_seq: SeqNum) {
        let buffer = self
            .reliable_buffers
            .get_mut(&channel)
            .expect("a recorded channel has a reliable buffer");
        for rel_seq in buffer.sequences_in_packet(packet_seq) {
            buffer.on_delivered(rel_seq);
            self.listener.on_delivered(channel, rel_seq);
        }
    }

    async fn retransmit_lost(&mut self, channel: ChannelId, packet_seq: SeqNum, now_ms: u64) {
        let buffer = self
            .reliable_buffers
            .get_mut(&channel)
            .expect("a recorded channel has a reliable buffer");
        let lost = buffer.sequences_in_packet(packet_seq);

        for rel_seq in lost {
            let payload = self
                .reliable_buffers
                .get_mut(&channel)
                .expect("a recorded channel has a reliable buffer")
                .on_lost(rel_seq);
            self.listener.on_lost(channel, rel_seq);

            debug!("retransmitting reliable message {}:{} from lost packet #{}", channel, rel_seq, packet_seq);
            self.write_message(channel, Some(rel_seq), &payload, now_ms).await;
        }
    }

    /// Frame one message into the packet under construction, flushing first if it does
    ///  not fit. For reliable messages this also keeps the channel record and the
    ///  buffer's packet assignment in sync with the packet that actually carries them.
    async fn write_message(
        &mut self,
        channel: ChannelId,
        rel_seq: Option<SeqNum>,
        payload: &Bytes,
        now_ms: u64,
    ) {
        assert!(
            payload.len() <= MAX_MESSAGE_BYTES,
            "message of {} bytes exceeds the {} byte maximum",
            payload.len(),
            MAX_MESSAGE_BYTES
        );

        let frame = Self::frame_message(channel, rel_seq, payload);
        assert!(
            frame.num_bits() <= self.config.max_payload_bits(),
            "message of {} bytes can never fit a single packet with this configuration",
            payload.len()
        );

        if !self.builder.write_bits(frame.as_slice(), frame.num_bits()) {
            self.flush(now_ms).await;
            let written = self.builder.write_bits(frame.as_slice(), frame.num_bits());
            assert!(written, "message does not fit into an empty packet");
        }
        // a reliable write is never a merge target, and ends any merge run
        if rel_seq.is_some() {
            self.mergeable = None;
        }

        if let Some(rel_seq) = rel_seq {
            let packet_seq = self.notify.peek_next_outgoing();
            self.reliable_buffers
                .get_mut(&channel)
                .expect("reliable writes come from an existing buffer")
                .assign_packet(rel_seq, packet_seq);
            self.channel_record.register(channel);
        }
    }

    fn frame_message(channel: ChannelId, rel_seq: Option<SeqNum>, payload: &Bytes) -> BitWriter {
        debug_assert!(payload.len() <= MAX_MESSAGE_BYTES);
        let mut frame = BitWriter::new();
        frame.write_bit(rel_seq.is_some());
        frame.write_bits(channel.to_raw() as u32, ChannelId::BITS);
        if let Some(rel_seq) = rel_seq {
            rel_seq.write(&mut frame);
        }
        frame.write_bits(payload.len() as u32, MSG_LEN_BITS);
        frame.write_slice_bits(payload, payload.len() * 8);

        let overhead = if rel_seq.is_some() {
            RELIABLE_FRAME_OVERHEAD_BITS
        }
        else {
            UNRELIABLE_FRAME_OVERHEAD_BITS
        };
        debug_assert_eq!(frame.num_bits(), payload.len() * 8 + overhead);
        frame
    }
}

/// A parsed message frame, as the dispatch layer would read it back out of a packet
///  payload. Lives here so the framing format has a single owner.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageFrame {
    pub channel: ChannelId,
    pub rel_seq: Option<SeqNum>,
    pub payload: Bytes,
}

impl MessageFrame {
    /// parse all message frames from a packet payload buffer, ignoring sub-byte padding
    pub fn parse_all(payload: &[u8]) -> anyhow::Result<Vec<MessageFrame>> {
        let mut reader = BitReader::new(payload);
        let mut result = Vec::new();
        while reader.remaining_bits() >= UNRELIABLE_FRAME_OVERHEAD_BITS {
            let reliable = reader.read_bit()?;
            let channel = ChannelId::from_raw(reader.read_bits(ChannelId::BITS)? as u16);
            let rel_seq = if reliable {
                Some(SeqNum::read(&mut reader)?)
            }
            else {
                None
            };
            let len_bytes = reader.read_bits(MSG_LEN_BITS)? as usize;

            let mut msg = BitWriter::new();
            for _ in 0..len_bytes * 8 {
                msg.write_bit(reader.read_bit()?);
            }
            result.push(MessageFrame {
                channel,
                rel_seq,
                payload: msg.into_bytes(),
            });
        }
        Ok(result)
    }
}
