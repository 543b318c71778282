//! Message-level view of a transport
//!
//! Frames `TunnelMessage`s with the tunnel codec and keeps a ledger of
//! which written frames were charged to a session's buffer budget, so a
//! flush can be credited back to the right sessions.

use std::collections::VecDeque;

use bytes::BytesMut;
use omm_tunnel_proto::{CodecError, StreamId, TunnelCodec, TunnelMessage};
use tracing::warn;

use crate::{Transport, TransportError, TransportResult};

pub struct TunnelChannel<T> {
    transport: T,
    read_buf: BytesMut,
    /// One entry per written, unflushed frame
    ledger: VecDeque<Option<StreamId>>,
}

impl<T: Transport> TunnelChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_buf: BytesMut::new(),
            ledger: VecDeque::new(),
        }
    }

    /// Send a protocol message that is not charged to any buffer budget
    pub fn send_message(&mut self, msg: &TunnelMessage) -> TransportResult<()> {
        self.write(msg, None)
    }

    /// Send a message charged to the buffer budget of `stream_id`
    pub fn send_tracked(&mut self, msg: &TunnelMessage, stream_id: StreamId) -> TransportResult<()> {
        self.write(msg, Some(stream_id))
    }

    fn write(&mut self, msg: &TunnelMessage, charged_to: Option<StreamId>) -> TransportResult<()> {
        let frame = TunnelCodec::encode(msg)?;
        self.transport.write(frame)?;
        self.ledger.push_back(charged_to);
        Ok(())
    }

    /// Flush queued frames; returns the streams whose charged frames left
    pub fn flush(&mut self) -> TransportResult<Vec<StreamId>> {
        let flushed = self.transport.flush()?;
        let mut credited = Vec::new();

        for _ in 0..flushed {
            match self.ledger.pop_front() {
                Some(Some(stream_id)) => credited.push(stream_id),
                Some(None) => {}
                None => {
                    warn!("Transport flushed more frames than were written");
                    break;
                }
            }
        }

        Ok(credited)
    }

    /// Read and decode every complete message currently available
    ///
    /// A frame that does not decode is dropped; the frames around it are
    /// still delivered in order.
    pub fn recv_messages(&mut self) -> TransportResult<Vec<TunnelMessage>> {
        loop {
            match self.transport.read() {
                Ok(Some(chunk)) => self.read_buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(TransportError::ConnectionClosed) if !self.read_buf.is_empty() => break,
                Err(e) => return Err(e),
            }
        }

        let mut messages = Vec::new();
        loop {
            match TunnelCodec::decode(&mut self.read_buf) {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => break,
                Err(CodecError::MessageTooLarge(len)) => {
                    warn!(len, buffered = self.read_buf.len(), "Oversized frame, dropping buffered input");
                    self.read_buf.clear();
                    break;
                }
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        }
        Ok(messages)
    }

    /// Drop everything not yet flushed, e.g. after the channel went down
    pub fn discard_unflushed(&mut self) -> Vec<StreamId> {
        let dropped = self.transport.discard();
        if dropped != self.ledger.len() {
            warn!(dropped, written = self.ledger.len(), "Discarded frame count does not match ledger");
        }
        self.ledger.drain(..).flatten().collect()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use bytes::Bytes;
    use omm_tunnel_proto::ContainerType;

    fn data(stream_id: StreamId) -> TunnelMessage {
        TunnelMessage::Data {
            stream_id,
            container_type: ContainerType::Opaque,
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_flush_credits_tracked_frames_only() {
        let (a, _b) = MemoryTransport::pair();
        let mut channel = TunnelChannel::new(a);

        channel.send_tracked(&data(10), 10).unwrap();
        channel.send_message(&TunnelMessage::Close { stream_id: 11 }).unwrap();
        channel.send_tracked(&data(12), 12).unwrap();

        assert_eq!(channel.flush().unwrap(), vec![10, 12]);
        assert!(channel.flush().unwrap().is_empty());
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let (a, b) = MemoryTransport::pair();
        let mut sender = TunnelChannel::new(a);
        let mut receiver = TunnelChannel::new(b);

        for stream_id in 1..=3 {
            sender.send_message(&data(stream_id)).unwrap();
        }
        sender.flush().unwrap();

        let received: Vec<StreamId> = receiver
            .recv_messages()
            .unwrap()
            .iter()
            .map(TunnelMessage::stream_id)
            .collect();
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn test_bad_frame_does_not_drop_neighbours() {
        let (a, b) = MemoryTransport::pair();
        let mut sender = TunnelChannel::new(a);
        let mut receiver = TunnelChannel::new(b);

        sender.send_message(&data(1)).unwrap();
        sender
            .transport_mut()
            .write(Bytes::from_static(&[0, 0, 0, 2, 0xff, 0xff]))
            .unwrap();
        sender.send_message(&data(3)).unwrap();
        sender.flush().unwrap();

        let received: Vec<StreamId> = receiver
            .recv_messages()
            .unwrap()
            .iter()
            .map(TunnelMessage::stream_id)
            .collect();
        assert_eq!(received, vec![1, 3]);
        assert!(receiver.recv_messages().unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_is_not_in_ledger() {
        let (a, _b) = MemoryTransport::pair();
        let mut channel = TunnelChannel::new(a);

        channel.transport_mut().fail_next_writes(1);
        assert!(channel.send_tracked(&data(10), 10).is_err());
        assert!(channel.flush().unwrap().is_empty());
    }

    #[test]
    fn test_partial_flush_credits_sent_frames() {
        let (a, _b) = MemoryTransport::pair();
        let mut channel = TunnelChannel::new(a);

        for stream_id in [10, 11, 12] {
            channel.send_tracked(&data(stream_id), stream_id).unwrap();
        }

        channel.transport_mut().fail_flush_after(Some(2));
        assert_eq!(channel.flush().unwrap(), vec![10, 11]);
        assert!(channel.flush().is_err());

        assert_eq!(channel.discard_unflushed(), vec![12]);
    }

    #[test]
    fn test_discard_unflushed() {
        let (a, _b) = MemoryTransport::pair();
        let mut channel = TunnelChannel::new(a);

        channel.send_tracked(&data(10), 10).unwrap();
        channel.send_message(&TunnelMessage::Close { stream_id: 10 }).unwrap();

        assert_eq!(channel.discard_unflushed(), vec![10]);
        assert_eq!(channel.transport().pending_frames(), 0);
        assert!(channel.flush().unwrap().is_empty());
    }
}
