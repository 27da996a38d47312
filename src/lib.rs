//! Reliability core for a game-style UDP transport: packet sequencing, ack/nak tracking,
//!  per-channel reliable delivery and bit-budgeted packet framing, without owning sockets
//!  or threads.
//!
//! ## Design goals
//!
//! * Low latency over TCP-style strictness: unreliable messages are fire-and-forget,
//!   reliable messages are retransmitted but never stall unrelated traffic
//!   * acknowledgment is piggybacked on regular packet headers - there are no dedicated
//!     ack packets, an idle connection just flushes header-only keepalives
//!   * loss is detected from the peer's ack history rather than timeouts, bounding
//!     detection latency to the history window
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data)
//!   multiplexed over logical *channels* on one connection
//!   * each channel has its own reliable sequence space and its own bounded buffer of
//!     unacknowledged messages; a full buffer surfaces as backpressure, never as silent
//!     dropping of reliable data
//! * Packets are sized to avoid IP-level fragmentation (configured MTU, since path
//!   discovery does not work reliably), and filled with bit-level precision: space is
//!   budgeted in bits, small successive writes can be merged into one message frame
//! * The core is single-threaded and deterministic: all timestamps come in as explicit
//!   parameters, all I/O goes through narrow async seams, so the whole state machine is
//!   testable without a network or a clock
//! * Instrumentation is built in rather than bolted on: smoothed jitter from a 10-bit
//!   send clock in every header, and windowed traffic / loss statistics
//!
//! Cryptography, handshakes and high-level object replication are deliberately out of
//!  scope; this crate is the layer such features sit on top of.
//!
//! ## Wire format
//!
//! Every packet starts with the header (bit-level layout, no byte alignment; `W` is the
//!  configured ack history width, which both peers must agree on):
//!
//! ```ascii
//! [seq: 14]              this packet's sequence number, modulo 2^14
//! [ack_base: 14]         highest sequence number received from the peer
//! [ack_history: W]       delivery bit per packet preceding ack_base, most recent first
//! [has_jitter_clock: 1]
//! [jitter_clock: 10]     if flagged: sender's clock at send time, millis mod 1024
//! [has_frame_time: 1]
//! [frame_time: 8]        if flagged: sender's frame processing time in millis
//! ```
//!
//! The rest of the packet is a run of message frames:
//!
//! ```ascii
//! [reliable: 1]
//! [channel_id: 10]
//! [rel_seq: 14]          only present for reliable messages
//! [len: 13]              payload length in bytes
//! [payload: len * 8]
//! ```
//!
//! Bits left over after the last frame (always fewer than 8) are padding. A configurable
//!  number of trailer bits at the end of the packet is reserved for the outer transport
//!  and never used for payload.

mod bit_buffer;
mod channel_record;
mod config;
mod connection;
mod error;
mod jitter;
mod packet_builder;
mod packet_header;
mod packet_notify;
mod reliable_buffer;
mod rolling_data;
mod send_pipeline;
mod sequence;
mod stats;

pub use bit_buffer::{BitReader, BitWriter};
pub use channel_record::{ChannelId, ChannelRecord};
pub use config::ReliabilityConfig;
pub use connection::{Connection, ConnectionListener, MessageFrame, MAX_MESSAGE_BYTES};
pub use error::TransportError;
pub use jitter::JitterTracker;
pub use packet_builder::PacketBuilder;
pub use packet_header::PacketHeader;
pub use packet_notify::{PacketDisposition, PacketNotify, ReceiveOutcome};
pub use reliable_buffer::ReliableBuffer;
pub use send_pipeline::{SendPipeline, SendSocket};
pub use sequence::{SeqNum, SequenceHistory};
pub use stats::{ConnectionStatsAggregator, ConnectionStatsSnapshot};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
