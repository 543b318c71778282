//! Output buffers and flow control
//!
//! Each session owns a [`BufferPool`] bounded by its guaranteed output
//! buffer count. A buffer counts against the bound from `acquire` until it
//! is either released unsent or submitted and then confirmed flushed.
//!
//! Once the tunnel is open the pool also enforces the negotiated send
//! window: the bytes submitted and not yet flushed may not exceed the
//! peer's receive window.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use omm_tunnel_proto::StreamId;
use thiserror::Error;
use tracing::debug;

use crate::error::{SessionError, SessionResult};

/// Writable output buffer bound to one tunnel stream
#[derive(Debug)]
pub struct TunnelBuffer {
    stream_id: StreamId,
    data: BytesMut,
    max_len: usize,
}

impl TunnelBuffer {
    fn new(stream_id: StreamId, size_hint: usize, max_len: usize) -> Self {
        Self {
            stream_id,
            data: BytesMut::with_capacity(size_hint),
            max_len,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Append bytes, refusing to grow past the negotiated message size
    pub fn write(&mut self, bytes: &[u8]) -> SessionResult<()> {
        let size = self.data.len() + bytes.len();
        if size > self.max_len {
            return Err(SessionError::MessageTooLarge {
                size,
                max: self.max_len,
            });
        }
        self.data.put_slice(bytes);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Result of asking for an output buffer
#[derive(Debug)]
pub enum BufferGrant {
    Granted(TunnelBuffer),
    /// Every guaranteed buffer is in use; retry after the next dispatch
    Busy,
}

impl BufferGrant {
    pub fn is_busy(&self) -> bool {
        matches!(self, BufferGrant::Busy)
    }

    pub fn into_buffer(self) -> Option<TunnelBuffer> {
        match self {
            BufferGrant::Granted(buffer) => Some(buffer),
            BufferGrant::Busy => None,
        }
    }
}

/// A submit that the transport refused; the caller owns the buffer again
#[derive(Debug, Error)]
#[error("Submit failed: {source}")]
pub struct SubmitError {
    pub buffer: TunnelBuffer,
    #[source]
    pub source: SessionError,
}

impl SubmitError {
    pub fn into_buffer(self) -> TunnelBuffer {
        self.buffer
    }
}

#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    max_msg_size: usize,
    /// Acquired and not yet submitted or released
    held: usize,
    /// Byte length of every submitted, unflushed buffer, in submit order
    in_flight: VecDeque<usize>,
    bytes_in_flight: usize,
    send_window: Option<usize>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_msg_size: usize) -> Self {
        Self {
            capacity,
            max_msg_size,
            held: 0,
            in_flight: VecDeque::new(),
            bytes_in_flight: 0,
            send_window: None,
        }
    }

    pub fn acquire(&mut self, stream_id: StreamId, size_hint: usize) -> SessionResult<BufferGrant> {
        if size_hint > self.max_msg_size {
            return Err(SessionError::MessageTooLarge {
                size: size_hint,
                max: self.max_msg_size,
            });
        }

        if self.held + self.in_flight.len() >= self.capacity {
            debug!(stream_id = %stream_id, "No output buffer available");
            return Ok(BufferGrant::Busy);
        }

        if !self.is_send_window_open(size_hint) {
            debug!(
                stream_id = %stream_id,
                in_flight = self.bytes_in_flight,
                size_hint,
                "Send window full"
            );
            return Ok(BufferGrant::Busy);
        }

        self.held += 1;
        Ok(BufferGrant::Granted(TunnelBuffer::new(
            stream_id,
            size_hint,
            self.max_msg_size,
        )))
    }

    /// Return a buffer that will not be sent
    pub fn release(&mut self, buffer: TunnelBuffer) {
        drop(buffer);
        self.held = self.held.saturating_sub(1);
    }

    /// Whether `size` more bytes fit in the send window
    ///
    /// An empty window always admits one message.
    pub fn is_send_window_open(&self, size: usize) -> bool {
        match self.send_window {
            Some(window) => self.in_flight.is_empty() || self.bytes_in_flight + size <= window,
            None => true,
        }
    }

    /// A held buffer of `len` bytes was handed to the transport
    pub fn on_submitted(&mut self, len: usize) {
        self.held = self.held.saturating_sub(1);
        self.in_flight.push_back(len);
        self.bytes_in_flight += len;
    }

    /// `count` submitted buffers left the transport
    pub fn on_flushed(&mut self, count: usize) {
        for _ in 0..count {
            match self.in_flight.pop_front() {
                Some(len) => self.bytes_in_flight -= len,
                None => break,
            }
        }
    }

    /// Forget submitted buffers and the window, e.g. when the session closes
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.bytes_in_flight = 0;
        self.send_window = None;
    }

    /// Submitted buffers not yet confirmed flushed
    pub fn buffers_used(&self) -> usize {
        self.in_flight.len()
    }

    /// Bytes submitted and not yet confirmed flushed
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn set_send_window(&mut self, window: Option<usize>) {
        self.send_window = window;
    }

    pub fn send_window(&self) -> Option<usize> {
        self.send_window
    }

    pub fn buffers_held(&self) -> usize {
        self.held
    }

    pub fn set_max_msg_size(&mut self, max_msg_size: usize) {
        self.max_msg_size = max_msg_size;
    }

    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }
}
