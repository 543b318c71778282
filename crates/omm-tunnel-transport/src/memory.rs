//! In-memory transport
//!
//! Two connected endpoints backed by unbounded channels. Writes are held
//! locally until `flush`, so callers can observe unflushed frames.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::{Transport, TransportError, TransportResult};

#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: VecDeque<Bytes>,
    connected: bool,
    failing_writes: usize,
    /// Frames a flush may still send before failing
    flush_budget: Option<usize>,
}

impl MemoryTransport {
    /// Create two transports connected to each other
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            tx,
            rx,
            pending: VecDeque::new(),
            connected: true,
            failing_writes: 0,
            flush_budget: None,
        }
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Let flushes send `count` more frames, then fail until cleared with
    /// `None`
    pub fn fail_flush_after(&mut self, count: Option<usize>) {
        self.flush_budget = count;
    }

    /// Frames written but not yet flushed
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, frame: Bytes) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::ConnectionClosed);
        }

        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(TransportError::WriteFailed("injected write failure".to_string()));
        }

        self.pending.push_back(frame);
        Ok(())
    }

    fn flush(&mut self) -> TransportResult<usize> {
        if !self.connected {
            return Err(TransportError::ConnectionClosed);
        }

        let mut flushed = 0;
        let mut failure = None;
        while let Some(frame) = self.pending.pop_front() {
            if self.flush_budget == Some(0) {
                self.pending.push_front(frame);
                failure = Some(TransportError::WriteFailed("injected flush failure".to_string()));
                break;
            }
            if let Err(mpsc::error::SendError(frame)) = self.tx.send(frame) {
                self.pending.push_front(frame);
                self.connected = false;
                failure = Some(TransportError::ConnectionClosed);
                break;
            }
            if let Some(budget) = self.flush_budget.as_mut() {
                *budget -= 1;
            }
            flushed += 1;
        }

        match failure {
            Some(e) if flushed == 0 => Err(e),
            Some(e) => {
                warn!(flushed, remaining = self.pending.len(), "Flush stopped early: {}", e);
                Ok(flushed)
            }
            None => {
                if flushed > 0 {
                    debug!("Flushed {} frame(s)", flushed);
                }
                Ok(flushed)
            }
        }
    }

    fn read(&mut self) -> TransportResult<Option<Bytes>> {
        match self.rx.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.connected = false;
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn close(&mut self) {
        self.connected = false;
        self.pending.clear();
        self.rx.close();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_held_until_flush() {
        let (mut a, mut b) = MemoryTransport::pair();

        a.write(Bytes::from_static(b"one")).unwrap();
        a.write(Bytes::from_static(b"two")).unwrap();
        assert_eq!(a.pending_frames(), 2);
        assert_eq!(b.read().unwrap(), None);

        assert_eq!(a.flush().unwrap(), 2);
        assert_eq!(b.read().unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(b.read().unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(b.read().unwrap(), None);
    }

    #[test]
    fn test_injected_write_failure() {
        let (mut a, _b) = MemoryTransport::pair();
        a.fail_next_writes(1);

        assert!(matches!(
            a.write(Bytes::from_static(b"x")),
            Err(TransportError::WriteFailed(_))
        ));
        assert!(a.write(Bytes::from_static(b"y")).is_ok());
    }

    #[test]
    fn test_partial_flush_reports_sent_frames() {
        let (mut a, mut b) = MemoryTransport::pair();
        for frame in [b"one", b"two", b"six"] {
            a.write(Bytes::from_static(frame)).unwrap();
        }

        a.fail_flush_after(Some(2));
        assert_eq!(a.flush().unwrap(), 2);
        assert_eq!(a.pending_frames(), 1);
        assert!(matches!(a.flush(), Err(TransportError::WriteFailed(_))));

        a.fail_flush_after(None);
        assert_eq!(a.flush().unwrap(), 1);
        assert_eq!(b.read().unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(b.read().unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(b.read().unwrap(), Some(Bytes::from_static(b"six")));
    }

    #[test]
    fn test_peer_drop_disconnects() {
        let (mut a, b) = MemoryTransport::pair();
        drop(b);

        assert!(a.read().is_err());
        assert!(!a.is_connected());
    }

    #[test]
    fn test_closed_transport_rejects_writes() {
        let (mut a, _b) = MemoryTransport::pair();
        a.close();

        assert!(!a.is_connected());
        assert!(matches!(
            a.write(Bytes::from_static(b"x")),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
