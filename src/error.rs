use thiserror::Error;

use crate::channel_record::ChannelId;

/// Recoverable and connection-level error conditions of the reliability core.
///
/// Programming errors - writing past a bit budget that was already checked, or consuming
///  the channel record out of sequence order - are asserted, not represented here: they
///  can never arise from network conditions, only from bugs in the calling code.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TransportError {
    /// Backpressure: the per-channel buffer of unacknowledged reliable messages is at
    ///  capacity. The caller must stop sending reliable data on this channel until
    ///  acks free up room; this is not a connection fault.
    #[error("reliable buffer for channel {channel} is full")]
    ReliableBufferFull { channel: ChannelId },

    /// The message is too large to ever fit a single packet under the connection's
    ///  configuration. Messages are not chunked at this layer; the caller must split
    ///  the payload (`Connection::max_message_bytes` gives the effective limit).
    #[error("message of {size_bytes} bytes exceeds the {max_bytes} byte limit of this configuration")]
    MessageTooLarge { size_bytes: usize, max_bytes: usize },

    /// The peer sent a header that fails structural validation, e.g. acknowledging a
    ///  sequence number we never sent. The owning connection should treat this as cause
    ///  for closing the connection - it indicates severe corruption or an attack, and
    ///  is never retried.
    #[error("malformed packet header from peer: {reason}")]
    MalformedHeader { reason: String },
}
