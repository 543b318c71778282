//! Codec for the tunnel envelope and its sub-messages
//!
//! This frames collaborator messages between two endpoints. It does not
//! define the OMM field-level wire layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::messages::{SubMsg, TunnelMessage};
use crate::DEFAULT_MAX_MSG_SIZE;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Length-prefixed bincode framing of [`TunnelMessage`]s
pub struct TunnelCodec;

impl TunnelCodec {
    /// Largest frame body accepted: a maximum-size tunnel message plus
    /// envelope overhead
    pub const MAX_FRAME_SIZE: usize = 2 * DEFAULT_MAX_MSG_SIZE as usize;

    const HEADER_LEN: usize = 4;

    /// Frame layout: big-endian `u32` body length, then the bincode body
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let body = bincode::serialize(msg)?;
        if body.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(body.len()));
        }

        let mut frame = BytesMut::with_capacity(Self::HEADER_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Take one complete frame off the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// still incomplete. A body that fails to deserialize is still
    /// consumed, so decoding resumes at the next frame. An oversized
    /// length header consumes nothing; the stream cannot be resynchronized
    /// after it.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, CodecError> {
        let mut header = &buf[..];
        if header.remaining() < Self::HEADER_LEN {
            return Ok(None);
        }
        let body_len = header.get_u32() as usize;
        if body_len > Self::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(body_len));
        }
        if buf.len() < Self::HEADER_LEN + body_len {
            return Ok(None);
        }

        buf.advance(Self::HEADER_LEN);
        let body = buf.split_to(body_len);
        Ok(Some(bincode::deserialize(&body)?))
    }

    /// Encode a sub-message into the body of a `Msg` container
    pub fn encode_sub_msg(msg: &SubMsg) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(msg)?)
    }

    pub fn decode_sub_msg(data: &[u8]) -> Result<SubMsg, CodecError> {
        Ok(bincode::deserialize(data)?)
    }
}
