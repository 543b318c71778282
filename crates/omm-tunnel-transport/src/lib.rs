//! Transport abstraction for the reactor channel
//!
//! The physical connection is owned by another component. The tunnel layer
//! only needs ordered bytes, a non-blocking read and an explicit flush that
//! reports how many queued frames actually left.

pub mod channel;
pub mod memory;

pub use channel::TunnelChannel;
pub use memory::MemoryTransport;

use bytes::Bytes;
use omm_tunnel_proto::CodecError;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Non-blocking, ordered byte transport
pub trait Transport {
    /// Queue one frame for sending; frames leave in write order
    fn write(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Push queued frames to the peer, returning how many were flushed
    ///
    /// A failure after some frames left still reports those frames and
    /// keeps the rest queued; the error surfaces on the next call.
    fn flush(&mut self) -> TransportResult<usize>;

    /// Next chunk received from the peer, or `None` when nothing is waiting
    fn read(&mut self) -> TransportResult<Option<Bytes>>;

    /// Drop queued frames that were never flushed, returning how many
    fn discard(&mut self) -> usize;

    /// Close the transport
    fn close(&mut self);

    /// Check if transport is connected
    fn is_connected(&self) -> bool;
}

/// Lifecycle events of the underlying channel
///
/// Produced by the connection manager (including warm standby and
/// preferred host handling); consumed here only to time recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    ChannelUp,
    ChannelDown,
    ChannelDownReconnecting,
    PreferredHostStartingFallback,
    PreferredHostComplete,
}

impl ChannelEvent {
    /// Whether the channel can no longer carry tunnel traffic
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            ChannelEvent::ChannelDown | ChannelEvent::ChannelDownReconnecting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_event_is_down() {
        assert!(ChannelEvent::ChannelDown.is_down());
        assert!(ChannelEvent::ChannelDownReconnecting.is_down());
        assert!(!ChannelEvent::ChannelUp.is_down());
        assert!(!ChannelEvent::PreferredHostStartingFallback.is_down());
    }
}
