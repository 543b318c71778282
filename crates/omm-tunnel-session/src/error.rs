//! Session error types

use omm_tunnel_proto::{CodecError, StreamId};
use omm_tunnel_transport::TransportError;
use thiserror::Error;

use crate::cos::CosRejectReason;
use crate::session::Role;

/// Errors returned by tunnel session operations
///
/// Busy conditions are not errors; see [`crate::BufferGrant`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown tunnel stream: {0}")]
    UnknownStream(StreamId),

    #[error("Tunnel stream {0} is not open")]
    NotOpen(StreamId),

    #[error("Tunnel stream {0} has no output buffer available")]
    Busy(StreamId),

    #[error("A tunnel stream is already open for {0}")]
    AlreadyOpen(String),

    #[error("Stream id {0} is already in use")]
    StreamIdInUse(StreamId),

    #[error("No more tunnel streams can be accepted (limit {0})")]
    CapacityExhausted(usize),

    #[error("Class of service mismatch: {0}")]
    CosMismatch(#[from] CosRejectReason),

    #[error("No pending tunnel request for stream {0}")]
    NoPendingRequest(StreamId),

    #[error("Queue stream is not open")]
    QueueNotOpen,

    #[error("Queue stream already requested")]
    QueueAlreadyRequested,

    #[error("No acknowledgement pending for queue message {0}")]
    NoPendingAck(u64),

    #[error("Message of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Buffer belongs to tunnel stream {0}")]
    ForeignBuffer(StreamId),

    #[error("Operation not supported by a {0} reactor")]
    WrongRole(Role),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type SessionResult<T> = Result<T, SessionError>;
